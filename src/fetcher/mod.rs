use crate::config::FetcherConfig;
use crate::pool_bundle::{self, PoolBundleRecords};
use crate::queue::{Admission, TaskQueue, TaskRunner};
use crate::recovery::{FailureSite, RecoveryOrchestrator};
use crate::registry::EntityRegistry;
use crate::rpc::{AuthorizationCapability, QueryError, RemoteQueryClient};
use crate::store::BalanceStore;
use crate::types::{format_amount, BalanceRecord, BalanceUpdate, EntityKey, FetchTask, Priority, TaskKind};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const WALLET_NOT_CONNECTED: &str = "Wallet not connected";

/// Executes admitted tasks against the remote node and the wallet.
pub struct FetchWorker {
    pub(crate) registry: Arc<dyn EntityRegistry>,
    pub(crate) client: Arc<dyn RemoteQueryClient>,
    pub(crate) auth: Arc<dyn AuthorizationCapability>,
    pub(crate) recovery: RecoveryOrchestrator,
    timeout: Duration,
}

impl FetchWorker {
    pub fn new(
        config: &FetcherConfig,
        registry: Arc<dyn EntityRegistry>,
        client: Arc<dyn RemoteQueryClient>,
        auth: Arc<dyn AuthorizationCapability>,
    ) -> Self {
        Self {
            recovery: RecoveryOrchestrator::new(config, Arc::clone(&auth)),
            registry,
            client,
            auth,
            timeout: config.task_timeout(),
        }
    }

    /// Bound a remote call; expiry counts as a network failure.
    pub(crate) async fn timed<T>(&self, call: impl Future<Output = Result<T, QueryError>>) -> Result<T, QueryError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(self.timeout)),
        }
    }

    /// Viewing key for `contract`, or `AuthorizationRequired` when the wallet has none.
    pub(crate) async fn viewing_key(&self, contract: &str) -> Result<String, QueryError> {
        self.auth
            .grant(contract)
            .await?
            .ok_or_else(|| QueryError::AuthorizationRequired {
                contract: contract.to_string(),
            })
    }

    async fn fetch_single(&self, queue: &TaskQueue, task: &FetchTask) {
        let store = queue.store();
        let key = &task.entity;
        store.set_loading(key, true);

        let Some(info) = self.registry.lookup(key) else {
            warn!(entity = %key, "Unknown token");
            store.set_error(key, format!("Unknown token {}", key));
            return;
        };
        let Some(account) = self.auth.current_account().await else {
            store.set_error(key, WALLET_NOT_CONNECTED);
            return;
        };

        let contract = key.as_str();
        let site = FailureSite {
            task,
            slot: key,
            contract,
        };
        let result = match self.viewing_key(contract).await {
            Ok(vk) => self.timed(self.client.query_balance(contract, &account, &vk)).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(raw) => match format_amount(&raw, info.decimals) {
                Some(value) => {
                    debug!(entity = %key, symbol = %info.symbol, value = %value, "Balance fetched");
                    store.set_value(key, value);
                    queue.cancel_follow_ups(key, task.kind);
                }
                None => self.recovery.handle_unparseable(queue, site, &raw),
            },
            Err(err) => self.recovery.handle_failure(queue, site, err),
        }
    }
}

#[async_trait]
impl TaskRunner for FetchWorker {
    async fn run(&self, queue: &TaskQueue, task: FetchTask) {
        if let Some(report) = &task.report {
            self.recovery.publish_report(queue, &task, report);
            return;
        }
        match task.kind {
            TaskKind::SingleBalance => self.fetch_single(queue, &task).await,
            TaskKind::PoolBundle => pool_bundle::fetch_bundle(self, queue, &task).await,
        }
    }
}

/// Entry point for observers: request fetches and read records.
pub struct BalanceFetcher {
    queue: TaskQueue,
}

impl BalanceFetcher {
    pub fn new(
        config: &FetcherConfig,
        registry: Arc<dyn EntityRegistry>,
        client: Arc<dyn RemoteQueryClient>,
        auth: Arc<dyn AuthorizationCapability>,
    ) -> Self {
        let worker = Arc::new(FetchWorker::new(config, registry, client, auth));
        Self {
            queue: TaskQueue::new(config, BalanceStore::new(), worker),
        }
    }

    pub async fn request_fetch(&self, key: &EntityKey, origin: &str) -> Admission {
        self.request_fetch_with_priority(key, origin, Priority::Normal).await
    }

    pub async fn request_fetch_with_priority(&self, key: &EntityKey, origin: &str, priority: Priority) -> Admission {
        self.queue
            .request(key.clone(), TaskKind::SingleBalance, origin, priority)
            .await
    }

    pub async fn request_pool_fetch(&self, pool: &EntityKey, origin: &str) -> Admission {
        self.queue
            .request(pool.clone(), TaskKind::PoolBundle, origin, Priority::Normal)
            .await
    }

    pub fn get(&self, key: &EntityKey) -> BalanceRecord {
        self.queue.store().get(key)
    }

    pub fn pool_bundle(&self, pool: &EntityKey) -> PoolBundleRecords {
        PoolBundleRecords::read(self.queue.store(), pool)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BalanceUpdate> {
        self.queue.store().subscribe()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
