use crate::types::{EntityKey, TaskKind};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FollowUp {
    /// Delayed re-admission after a transient failure.
    Retry,
    /// Grant recovery branch, possibly waiting on the user.
    Recovery,
}

type FollowUpKey = (EntityKey, TaskKind, FollowUp);

/// Cancellable background follow-ups, at most one per entity, kind and follow-up type.
#[derive(Default)]
pub struct Scheduler {
    handles: Arc<DashMap<FollowUpKey, (u64, AbortHandle)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Scheduler {
    /// Run `job` in the background, replacing (aborting) any job already scheduled under the same key.
    pub fn spawn<F>(&self, entity: &EntityKey, kind: TaskKind, follow_up: FollowUp, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (entity.clone(), kind, follow_up);
        let handles = Arc::clone(&self.handles);
        let cleanup_key = key.clone();
        let wrapped = async move {
            job.await;
            handles.remove_if(&cleanup_key, |_, (current, _)| *current == id);
        };

        // The entry lock is held across the spawn so the job cannot finish and clean up
        // before its handle is stored.
        match self.handles.entry(key) {
            Entry::Occupied(mut entry) => {
                let handle = tokio::spawn(wrapped).abort_handle();
                let (_, previous) = entry.insert((id, handle));
                previous.abort();
                debug!(entity = %entity, ?follow_up, "Replaced scheduled follow-up");
            }
            Entry::Vacant(entry) => {
                let handle = tokio::spawn(wrapped).abort_handle();
                entry.insert((id, handle));
            }
        }
    }

    /// Abort every follow-up scheduled for `entity`/`kind`.
    pub fn cancel(&self, entity: &EntityKey, kind: TaskKind) {
        for follow_up in [FollowUp::Retry, FollowUp::Recovery] {
            if let Some((_, (_, handle))) = self.handles.remove(&(entity.clone(), kind, follow_up)) {
                handle.abort();
                debug!(entity = %entity, ?follow_up, "Cancelled scheduled follow-up");
            }
        }
    }

    pub fn is_scheduled(&self, entity: &EntityKey, kind: TaskKind, follow_up: FollowUp) -> bool {
        self.handles.contains_key(&(entity.clone(), kind, follow_up))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort everything and refuse new jobs.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let keys: Vec<FollowUpKey> = self.handles.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, (_, handle))) = self.handles.remove(&key) {
                handle.abort();
            }
        }
    }
}
