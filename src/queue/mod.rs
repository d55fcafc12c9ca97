mod scheduler;

pub use scheduler::{FollowUp, Scheduler};

use crate::config::FetcherConfig;
use crate::store::BalanceStore;
use crate::types::{EntityKey, FetchTask, Priority, TaskKind};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Executes one admitted task. The queue passes itself so follow-ups can be re-admitted.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, queue: &TaskQueue, task: FetchTask);
}

/// Outcome of an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// A task for the same entity and kind is pending or in flight.
    AlreadyPending,
    /// Follow-up parked until the task owning the entity completes.
    Deferred,
    /// The record was updated within the staleness window.
    Fresh,
    Closed,
}

struct QueueState {
    /// Sorted by priority, insertion order within a tier.
    pending: Vec<FetchTask>,
    in_flight: HashSet<(EntityKey, TaskKind)>,
    /// Follow-ups waiting for the pending or running task of the same entity and kind.
    deferred: HashMap<(EntityKey, TaskKind), Vec<FetchTask>>,
    draining: bool,
    closed: bool,
    batches: u64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    store: BalanceStore,
    runner: Arc<dyn TaskRunner>,
    scheduler: Scheduler,
    concurrency: usize,
    inter_batch_delay: Duration,
    staleness_window: Duration,
}

/// Deduplicating priority queue drained in bounded batches by a single loop.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(config: &FetcherConfig, store: BalanceStore, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    pending: Vec::new(),
                    in_flight: HashSet::new(),
                    deferred: HashMap::new(),
                    draining: false,
                    closed: false,
                    batches: 0,
                }),
                store,
                runner,
                scheduler: Scheduler::default(),
                concurrency: config.concurrency(),
                inter_batch_delay: config.inter_batch_delay(),
                staleness_window: config.staleness_window(),
            }),
        }
    }

    pub fn store(&self) -> &BalanceStore {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub async fn request(&self, entity: EntityKey, kind: TaskKind, origin: &str, priority: Priority) -> Admission {
        self.enqueue(FetchTask::new(entity, kind, origin, priority)).await
    }

    /// Admit `task` unless it is redundant, then make sure the drain loop is running.
    pub async fn enqueue(&self, task: FetchTask) -> Admission {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Admission::Closed;
        }

        let dedup = task.dedup_key();
        let duplicate = state.in_flight.contains(&dedup)
            || state
                .pending
                .iter()
                .any(|queued| queued.entity == task.entity && queued.kind == task.kind);
        if duplicate {
            if task.attempt.is_first() {
                debug!(entity = %task.entity, kind = ?task.kind, origin = %task.origin, "Task already pending, dropped");
                return Admission::AlreadyPending;
            }
            let parked = state.deferred.entry(dedup).or_default();
            if !parked.contains(&task) {
                debug!(entity = %task.entity, kind = ?task.kind, origin = %task.origin, "Follow-up deferred");
                parked.push(task);
            }
            return Admission::Deferred;
        }

        if task.attempt.is_first() && self.is_fresh(&task) {
            debug!(entity = %task.entity, kind = ?task.kind, origin = %task.origin, "Record still fresh, dropped");
            return Admission::Fresh;
        }

        for key in task.record_keys() {
            self.inner.store.ensure(&key);
        }

        debug!(
            entity = %task.entity,
            kind = ?task.kind,
            origin = %task.origin,
            priority = ?task.priority,
            attempt = ?task.attempt,
            "Task queued"
        );
        let position = state.pending.partition_point(|queued| queued.priority <= task.priority);
        state.pending.insert(position, task);

        if !state.draining {
            state.draining = true;
            tokio::spawn(self.clone().supervise_drain());
        }
        Admission::Queued
    }

    /// A bundle is fresh only while its LP slot is fresh and none of its slots is erroring.
    fn is_fresh(&self, task: &FetchTask) -> bool {
        let store = &self.inner.store;
        store.is_fresh(&task.record_key(), self.inner.staleness_window)
            && task.record_keys().iter().all(|key| !store.get(key).is_erroring())
    }

    /// Re-admit `task` after `delay`. Replaces any retry already scheduled for the entity.
    pub fn schedule_retry(&self, task: FetchTask, delay: Duration) {
        let queue = self.clone();
        let (entity, kind) = (task.entity.clone(), task.kind);
        self.inner.scheduler.spawn(&entity, kind, FollowUp::Retry, async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(task).await;
        });
    }

    /// Run a recovery branch in the background without blocking the drain loop.
    pub fn spawn_recovery<F>(&self, entity: &EntityKey, kind: TaskKind, branch: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.scheduler.spawn(entity, kind, FollowUp::Recovery, branch);
    }

    /// Drop follow-ups made obsolete by a successful fetch.
    pub fn cancel_follow_ups(&self, entity: &EntityKey, kind: TaskKind) {
        self.inner.scheduler.cancel(entity, kind);
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn batches_dispatched(&self) -> u64 {
        self.inner.state.lock().await.batches
    }

    /// No queued, running or scheduled work.
    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.pending.is_empty()
            && state.in_flight.is_empty()
            && state.deferred.is_empty()
            && !state.draining
            && self.inner.scheduler.is_empty()
    }

    /// Refuse new work, drop pending tasks and abort scheduled follow-ups.
    /// Tasks already in flight run to completion.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        let dropped = state.pending.len() + state.deferred.values().map(Vec::len).sum::<usize>();
        state.pending.clear();
        state.deferred.clear();
        self.inner.scheduler.shutdown();
        debug!(dropped, "Task queue shut down");
    }

    async fn supervise_drain(self) {
        loop {
            let queue = self.clone();
            let Err(err) = tokio::spawn(async move { queue.drain().await }).await else {
                return;
            };
            error!(error = %err, "Drain loop aborted");
            let mut state = self.inner.state.lock().await;
            let orphaned: Vec<_> = state.in_flight.drain().collect();
            for key in orphaned {
                Self::promote_deferred(&mut state, &key);
            }
            if state.pending.is_empty() {
                state.draining = false;
                return;
            }
        }
    }

    async fn drain(&self) {
        loop {
            let batch = {
                let mut state = self.inner.state.lock().await;
                if state.pending.is_empty() {
                    state.draining = false;
                    return;
                }
                let room = self.inner.concurrency.saturating_sub(state.in_flight.len());
                let take = room.min(state.pending.len());
                let batch: Vec<FetchTask> = state.pending.drain(..take).collect();
                for task in &batch {
                    state.in_flight.insert(task.dedup_key());
                }
                state.batches += 1;
                batch
            };

            debug!(size = batch.len(), "Dispatching batch");
            join_all(batch.into_iter().map(|task| self.run_task(task))).await;

            // Exit under the same lock enqueue checks `draining` with, so work admitted
            // from here on either waits out the delay below or starts a fresh loop.
            {
                let mut state = self.inner.state.lock().await;
                if state.pending.is_empty() {
                    state.draining = false;
                    return;
                }
            }
            tokio::time::sleep(self.inner.inter_batch_delay).await;
        }
    }

    async fn run_task(&self, task: FetchTask) {
        let dedup = task.dedup_key();
        let record_keys = task.record_keys();

        let outcome = AssertUnwindSafe(self.inner.runner.run(self, task)).catch_unwind().await;
        if outcome.is_err() {
            error!(entity = %dedup.0, kind = ?dedup.1, "Fetch task panicked");
            for key in &record_keys {
                self.inner.store.set_error(key, "Internal error while fetching balance");
            }
        }

        let mut state = self.inner.state.lock().await;
        state.in_flight.remove(&dedup);
        Self::promote_deferred(&mut state, &dedup);
    }

    /// Move the oldest follow-up parked on `key` into the pending list.
    fn promote_deferred(state: &mut QueueState, key: &(EntityKey, TaskKind)) {
        let Some(parked) = state.deferred.get_mut(key) else {
            return;
        };
        let next = parked.remove(0);
        if parked.is_empty() {
            state.deferred.remove(key);
        }
        debug!(entity = %next.entity, kind = ?next.kind, attempt = ?next.attempt, "Deferred follow-up released");
        let position = state.pending.partition_point(|queued| queued.priority <= next.priority);
        state.pending.insert(position, next);
    }
}
