use crate::types::{BalanceRecord, BalanceUpdate, EntityKey};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Shared balance records keyed by entity.
///
/// Writes are last-writer-wins per record. Two concurrent writers to one key are
/// ruled out by the queue admitting at most one task per key, not by this type.
#[derive(Clone)]
pub struct BalanceStore {
    records: Arc<DashMap<EntityKey, BalanceRecord>>,
    updates: broadcast::Sender<BalanceUpdate>,
}

impl Default for BalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BalanceStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            records: Arc::new(DashMap::new()),
            updates,
        }
    }

    /// Current record, or the default record if the entity was never seen.
    pub fn get(&self, key: &EntityKey) -> BalanceRecord {
        self.records
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Create the default record if absent.
    pub fn ensure(&self, key: &EntityKey) {
        self.records.entry(key.clone()).or_default();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BalanceUpdate> {
        self.updates.subscribe()
    }

    pub fn set_loading(&self, key: &EntityKey, loading: bool) {
        self.update(key, |record| record.loading = loading);
    }

    /// Publish a fetched value. Clears error and authorization flags.
    pub fn set_value(&self, key: &EntityKey, value: String) {
        self.update(key, |record| {
            record.value = Some(value);
            record.loading = false;
            record.error = None;
            record.needs_authorization = false;
            record.last_updated = Some(Instant::now());
            record.updated_at = Some(Utc::now());
        });
    }

    pub fn set_error(&self, key: &EntityKey, message: impl Into<String>) {
        let message = message.into();
        self.update(key, |record| {
            record.error = Some(message);
            record.loading = false;
        });
    }

    pub fn set_needs_authorization(&self, key: &EntityKey, needs: bool) {
        self.update(key, |record| record.needs_authorization = needs);
    }

    pub fn set_recovery_attempted(&self, key: &EntityKey, attempted: bool) {
        self.update(key, |record| record.already_attempted_recovery = attempted);
    }

    /// Whether `key` holds a successful value younger than `window`.
    pub fn is_fresh(&self, key: &EntityKey, window: Duration) -> bool {
        self.records.get(key).is_some_and(|record| {
            record.value.is_some()
                && record.error.is_none()
                && record
                    .last_updated
                    .is_some_and(|at| at.elapsed() < window)
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn update(&self, key: &EntityKey, apply: impl FnOnce(&mut BalanceRecord)) {
        let record = {
            let mut entry = self.records.entry(key.clone()).or_default();
            apply(entry.value_mut());
            entry.value().clone()
        };
        // No receivers is fine: observers may poll `get` instead.
        let _ = self.updates.send(BalanceUpdate {
            entity: key.clone(),
            record,
        });
    }
}
