use crate::config::FetcherConfig;
use crate::queue::{Admission, TaskQueue};
use crate::rpc::{AuthorizationCapability, QueryError};
use crate::types::{Attempt, EntityKey, FetchTask, RecoveryReport, TaskKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Closed set of failure causes, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthorizationRequired,
    AuthorizationInvalid,
    AuthorizationRejected,
    Network,
    Contract,
    Unknown,
}

impl ErrorKind {
    pub fn classify(err: &QueryError) -> Self {
        match err {
            QueryError::AuthorizationRequired { .. } => ErrorKind::AuthorizationRequired,
            QueryError::AuthorizationInvalid { .. } => ErrorKind::AuthorizationInvalid,
            QueryError::AuthorizationRejected(_) => ErrorKind::AuthorizationRejected,
            QueryError::Network(_) | QueryError::Timeout(_) => ErrorKind::Network,
            QueryError::Contract(_) => ErrorKind::Contract,
            QueryError::Other(_) => ErrorKind::Unknown,
        }
    }

    /// Whether a first failure of this kind earns one delayed retry.
    pub fn retries_once(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Unknown)
    }
}

pub fn corrupted_grant_message(contract: &str) -> String {
    format!(
        "Viewing key for {} appears corrupted. Remove it from your wallet and create a new one manually.",
        contract
    )
}

pub fn manual_grant_message(contract: &str) -> String {
    format!(
        "Viewing key required for {}. Create one in your wallet (manual intervention required).",
        contract
    )
}

fn invalid_grant_message(contract: &str, attempt: Attempt) -> String {
    if attempt.is_first() {
        format!(
            "Viewing key for {} is invalid. Remove it from your wallet and create a new one.",
            contract
        )
    } else {
        format!(
            "Viewing key for {} is still invalid after retrying. Remove it from your wallet manually and create a new one.",
            contract
        )
    }
}

const REJECTED_MESSAGE: &str = "Viewing key request was declined. Request the balance again to retry.";

/// Where a failure happened: the task, the record it lands in and the contract queried.
#[derive(Debug, Clone, Copy)]
pub struct FailureSite<'a> {
    pub task: &'a FetchTask,
    pub slot: &'a EntityKey,
    pub contract: &'a str,
}

/// Turns classified failures into record updates and background recovery.
pub struct RecoveryOrchestrator {
    auth: Arc<dyn AuthorizationCapability>,
    retry_delay: Duration,
    recovery_delay: Duration,
    backoff: Vec<Duration>,
}

impl RecoveryOrchestrator {
    pub fn new(config: &FetcherConfig, auth: Arc<dyn AuthorizationCapability>) -> Self {
        Self {
            auth,
            retry_delay: config.retry_delay(),
            recovery_delay: config.recovery_delay(),
            backoff: config.backoff_delays(),
        }
    }

    pub fn handle_failure(&self, queue: &TaskQueue, site: FailureSite<'_>, err: QueryError) {
        let store = queue.store();
        let FailureSite { task, slot, contract } = site;
        let kind = ErrorKind::classify(&err);
        warn!(
            entity = %task.entity,
            slot = %slot,
            origin = %task.origin,
            attempt = ?task.attempt,
            ?kind,
            error = %err,
            "Fetch failed"
        );

        match kind {
            ErrorKind::AuthorizationRequired => {
                store.set_needs_authorization(slot, true);
                let record = store.get(slot);
                if task.attempt == Attempt::Verify {
                    self.fail_terminally(queue, site);
                } else if task.attempt.is_first() && !record.already_attempted_recovery {
                    store.set_recovery_attempted(slot, true);
                    store.set_loading(slot, false);
                    self.start_grant_recovery(queue, site);
                } else {
                    store.set_error(slot, manual_grant_message(contract));
                }
            }
            ErrorKind::AuthorizationInvalid => {
                store.set_needs_authorization(slot, true);
                if task.attempt == Attempt::Verify {
                    self.fail_terminally(queue, site);
                } else {
                    store.set_error(slot, invalid_grant_message(contract, task.attempt));
                }
            }
            ErrorKind::AuthorizationRejected => {
                store.set_needs_authorization(slot, true);
                store.set_error(slot, REJECTED_MESSAGE);
            }
            ErrorKind::Network | ErrorKind::Contract | ErrorKind::Unknown => {
                store.set_error(slot, err.to_string());
                if kind.retries_once() && task.attempt.is_first() {
                    queue.schedule_retry(task.follow_up(Attempt::Retry, "auto-retry"), self.retry_delay);
                }
            }
        }
    }

    /// A query succeeded but its amount could not be parsed.
    pub fn handle_unparseable(&self, queue: &TaskQueue, site: FailureSite<'_>, raw: &str) {
        if site.task.attempt == Attempt::Verify {
            queue.store().set_needs_authorization(site.slot, true);
            self.fail_terminally(queue, site);
        } else {
            warn!(entity = %site.task.entity, slot = %site.slot, raw, "Unparseable amount");
            queue
                .store()
                .set_error(site.slot, format!("Unexpected balance format from {}", site.contract));
        }
    }

    /// Staked query refused the LP viewing key: register the LP key on the staking
    /// contract once, then re-run the whole bundle.
    pub fn handle_staked_invalid(&self, queue: &TaskQueue, site: FailureSite<'_>, lp_token: &str, key: &str) {
        let store = queue.store();
        let FailureSite { task, slot, contract } = site;
        store.set_needs_authorization(slot, true);

        if store.get(slot).already_attempted_recovery {
            self.fail_terminally(queue, site);
            return;
        }
        store.set_recovery_attempted(slot, true);
        store.set_loading(slot, false);

        info!(pool = %task.entity, staking = contract, lp_token, "Copying LP viewing key to staking contract");
        let auth = Arc::clone(&self.auth);
        let branch_queue = queue.clone();
        let follow_up = task.follow_up(Attempt::Retry, "grant-copy");
        let delay = self.recovery_delay;
        let (slot, lp_token, staking, key) = (slot.clone(), lp_token.to_string(), contract.to_string(), key.to_string());
        queue.spawn_recovery(&task.entity, task.kind, async move {
            tokio::time::sleep(delay).await;
            let next = match auth.copy_grant(&lp_token, &staking, &key).await {
                Ok(tx) => {
                    info!(staking = %staking, tx_hash = %tx.tx_hash, "Viewing key copied");
                    follow_up
                }
                Err(err) => {
                    warn!(staking = %staking, error = %err, "Viewing key copy failed");
                    follow_up.reporting(slot, format!("Could not sync the LP viewing key to {}: {}", staking, err))
                }
            };
            readmit(&branch_queue, next).await;
        });
    }

    fn fail_terminally(&self, queue: &TaskQueue, site: FailureSite<'_>) {
        error!(entity = %site.task.entity, slot = %site.slot, "Viewing key unusable after recovery");
        queue.store().set_error(site.slot, corrupted_grant_message(site.contract));
        queue.cancel_follow_ups(&site.task.entity, site.task.kind);
    }

    /// Ask the wallet for a new viewing key after a debounce, then verify with fresh
    /// fetches. Runs detached: the wallet prompt may never be answered.
    fn start_grant_recovery(&self, queue: &TaskQueue, site: FailureSite<'_>) {
        let FailureSite { task, slot, contract } = site;
        let auth = Arc::clone(&self.auth);
        let branch_queue = queue.clone();
        let verify = task.follow_up(Attempt::Verify, "grant-recovery");
        let delay = self.recovery_delay;
        let backoff = match task.kind {
            TaskKind::PoolBundle => self.backoff.clone(),
            TaskKind::SingleBalance => Vec::new(),
        };
        let (slot, contract) = (slot.clone(), contract.to_string());

        info!(entity = %task.entity, contract = %contract, "Scheduling viewing key request");
        queue.spawn_recovery(&task.entity, task.kind, async move {
            tokio::time::sleep(delay).await;
            match auth.request_grant(&contract).await {
                Ok(()) => {
                    info!(contract = %contract, "Viewing key created, verifying");
                    readmit(&branch_queue, verify.clone()).await;
                    for wait in backoff {
                        tokio::time::sleep(wait).await;
                        let record = branch_queue.store().get(&slot);
                        if record.value.is_some() && !record.is_erroring() {
                            break;
                        }
                        readmit(&branch_queue, verify.clone()).await;
                    }
                }
                Err(err) => {
                    warn!(contract = %contract, error = %err, "Viewing key request failed");
                    let message = match ErrorKind::classify(&err) {
                        ErrorKind::AuthorizationRejected => REJECTED_MESSAGE.to_string(),
                        _ => format!("Could not create a viewing key for {}: {}", contract, err),
                    };
                    readmit(&branch_queue, verify.reporting(slot, message)).await;
                }
            }
        });
    }

    /// Write a recovery branch's failure from inside the queue. A value published
    /// since the branch started wins over the stale failure.
    pub fn publish_report(&self, queue: &TaskQueue, task: &FetchTask, report: &RecoveryReport) {
        let store = queue.store();
        let record = store.get(&report.slot);
        if record.value.is_some() && !record.is_erroring() {
            debug!(entity = %task.entity, slot = %report.slot, "Recovery failure superseded by a fetched value");
            return;
        }
        warn!(entity = %task.entity, slot = %report.slot, error = %report.message, "Recovery failed");
        store.set_needs_authorization(&report.slot, true);
        store.set_error(&report.slot, report.message.clone());
    }
}

/// Admit a recovery follow-up; it waits behind any task still running for the entity.
async fn readmit(queue: &TaskQueue, task: FetchTask) {
    let entity = task.entity.clone();
    if queue.enqueue(task).await == Admission::Closed {
        warn!(entity = %entity, "Queue closed, recovery follow-up dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_maps_timeout_to_network() {
        assert_eq!(
            ErrorKind::classify(&QueryError::Timeout(Duration::from_secs(30))),
            ErrorKind::Network
        );
        assert_eq!(ErrorKind::classify(&QueryError::Other("?".into())), ErrorKind::Unknown);
        assert_eq!(
            ErrorKind::classify(&QueryError::AuthorizationInvalid {
                contract: "c".into(),
                message: "m".into()
            }),
            ErrorKind::AuthorizationInvalid
        );
    }

    #[test]
    fn test_retry_policy() {
        assert!(ErrorKind::Network.retries_once());
        assert!(ErrorKind::Unknown.retries_once());
        assert!(!ErrorKind::Contract.retries_once());
        assert!(!ErrorKind::AuthorizationRejected.retries_once());
    }

    #[test]
    fn test_invalid_message_distinguishes_retry() {
        assert_ne!(
            invalid_grant_message("c", Attempt::First),
            invalid_grant_message("c", Attempt::Retry)
        );
        assert!(corrupted_grant_message("c").contains("manually"));
    }
}
