//! Pool bundle: LP balance, staked LP and pool TVL fetched as one admission unit.
//!
//! TVL runs concurrently with the LP chain. The staked query reuses the LP token's
//! viewing key, so it only runs once that key is known. Each slot is published on
//! its own; a failed slot never holds back the others.

use crate::fetcher::{FetchWorker, WALLET_NOT_CONNECTED};
use crate::queue::TaskQueue;
use crate::recovery::{ErrorKind, FailureSite};
use crate::store::BalanceStore;
use crate::types::{format_amount, BalanceRecord, EntityInfo, EntityKey, FetchTask, PoolSlot};
use tracing::{debug, warn};

/// The three records of one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolBundleRecords {
    pub tvl: BalanceRecord,
    pub lp_balance: BalanceRecord,
    pub staked_balance: BalanceRecord,
}

impl PoolBundleRecords {
    pub fn read(store: &BalanceStore, pool: &EntityKey) -> Self {
        Self {
            tvl: store.get(&pool.slot(PoolSlot::Tvl)),
            lp_balance: store.get(&pool.slot(PoolSlot::Lp)),
            staked_balance: store.get(&pool.slot(PoolSlot::Staked)),
        }
    }
}

pub(crate) async fn fetch_bundle(worker: &FetchWorker, queue: &TaskQueue, task: &FetchTask) {
    let store = queue.store();
    let pool = &task.entity;
    for slot in PoolSlot::ALL {
        store.set_loading(&pool.slot(slot), true);
    }

    let Some((info, lp_token)) = worker
        .registry
        .lookup(pool)
        .and_then(|info| info.lp_token.clone().map(|lp| (info, lp)))
    else {
        warn!(pool = %pool, "Unknown pool");
        for slot in PoolSlot::ALL {
            store.set_error(&pool.slot(slot), format!("Unknown pool {}", pool));
        }
        return;
    };

    let (tvl_ok, chain_ok) = futures::join!(
        fetch_tvl(worker, queue, task),
        fetch_lp_chain(worker, queue, task, &info, &lp_token)
    );

    if tvl_ok && chain_ok {
        debug!(pool = %pool, "Pool bundle fetched");
        queue.cancel_follow_ups(pool, task.kind);
    }
}

async fn fetch_tvl(worker: &FetchWorker, queue: &TaskQueue, task: &FetchTask) -> bool {
    let pool = &task.entity;
    let slot = pool.slot(PoolSlot::Tvl);
    match worker.timed(worker.client.query_pool_tvl(pool.as_str())).await {
        Ok(tvl) => {
            queue.store().set_value(&slot, tvl);
            true
        }
        Err(err) => {
            let site = FailureSite {
                task,
                slot: &slot,
                contract: pool.as_str(),
            };
            worker.recovery.handle_failure(queue, site, err);
            false
        }
    }
}

async fn fetch_lp_chain(
    worker: &FetchWorker,
    queue: &TaskQueue,
    task: &FetchTask,
    info: &EntityInfo,
    lp_token: &str,
) -> bool {
    let store = queue.store();
    let pool = &task.entity;
    let lp_slot = pool.slot(PoolSlot::Lp);
    let staked_slot = pool.slot(PoolSlot::Staked);
    let lp_site = FailureSite {
        task,
        slot: &lp_slot,
        contract: lp_token,
    };

    let Some(account) = worker.auth.current_account().await else {
        store.set_error(&lp_slot, WALLET_NOT_CONNECTED);
        store.set_error(&staked_slot, WALLET_NOT_CONNECTED);
        return false;
    };

    let key = match worker.viewing_key(lp_token).await {
        Ok(key) => key,
        Err(err) => {
            worker.recovery.handle_failure(queue, lp_site, err);
            if info.staking_contract.is_some() {
                // Unknown is not empty: never publish "0" here.
                store.set_error(&staked_slot, "Staked balance unavailable until the LP viewing key is available");
            } else {
                store.set_loading(&staked_slot, false);
            }
            return false;
        }
    };

    let lp_ok = match worker.timed(worker.client.query_balance(lp_token, &account, &key)).await {
        Ok(raw) => match format_amount(&raw, info.decimals) {
            Some(value) => {
                store.set_value(&lp_slot, value);
                true
            }
            None => {
                worker.recovery.handle_unparseable(queue, lp_site, &raw);
                false
            }
        },
        Err(err) => {
            worker.recovery.handle_failure(queue, lp_site, err);
            false
        }
    };

    let Some(staking) = info.staking_contract.as_deref() else {
        store.set_loading(&staked_slot, false);
        return lp_ok;
    };
    let staked_site = FailureSite {
        task,
        slot: &staked_slot,
        contract: staking,
    };

    match worker.timed(worker.client.query_staked(staking, &account, &key)).await {
        Ok(raw) => match format_amount(&raw, info.decimals) {
            Some(value) => {
                store.set_value(&staked_slot, value);
                store.set_recovery_attempted(&staked_slot, false);
                lp_ok
            }
            None => {
                worker.recovery.handle_unparseable(queue, staked_site, &raw);
                false
            }
        },
        Err(err) if lp_ok && ErrorKind::classify(&err) == ErrorKind::AuthorizationInvalid => {
            worker.recovery.handle_staked_invalid(queue, staked_site, lp_token, &key);
            false
        }
        Err(err) => {
            worker.recovery.handle_failure(queue, staked_site, err);
            false
        }
    }
}
