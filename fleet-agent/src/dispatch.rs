//! Reconcile dispatcher: a deduplicating work queue drained by a pool of
//! workers.
//!
//! An identity is queued at most once and never reconciled by two workers
//! at the same time. Enqueueing an identity that is in flight marks it
//! dirty; it goes back on the queue as soon as the running reconcile
//! finishes. Failures are retried with exponential backoff, and so are
//! requeues after a stale mirror was removed: a clock skew between pivot
//! and member can make every fresh mirror look stale again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;

use fleet_core::{ObjectKey, ResourceKind};
use fleet_sync::{SyncEngine, SyncOutcome};

use crate::error::{join_err, AgentError};
use crate::signal::ShutdownSignal;

/// Identity of one reconcile target.
pub type ObjectRef = (ResourceKind, ObjectKey);

/// Exponential retry delay for failed reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            factor: 2,
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base
            .saturating_mul(self.factor.saturating_pow(exp))
            .min(self.cap)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queued: VecDeque<ObjectRef>,
    pending: HashSet<ObjectRef>,
    in_flight: HashSet<ObjectRef>,
    dirty: HashSet<ObjectRef>,
    failures: HashMap<ObjectRef, u32>,
    stale: HashMap<ObjectRef, u32>,
}

/// Deduplicating FIFO of identities.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, item: ObjectRef) {
        let mut state = self.lock();
        if state.in_flight.contains(&item) {
            state.dirty.insert(item);
            return;
        }
        if state.pending.insert(item.clone()) {
            state.queued.push_back(item);
            drop(state);
            self.ready.notify_one();
        }
    }

    /// Takes the next identity and marks it in flight.
    pub async fn next(&self) -> ObjectRef {
        loop {
            if let Some(item) = self.try_next() {
                return item;
            }
            self.ready.notified().await;
        }
    }

    fn try_next(&self) -> Option<ObjectRef> {
        let mut state = self.lock();
        let item = state.queued.pop_front()?;
        state.pending.remove(&item);
        state.in_flight.insert(item.clone());
        let more = !state.queued.is_empty();
        drop(state);
        if more {
            self.ready.notify_one();
        }
        Some(item)
    }

    /// Releases an in-flight identity, requeueing it if it was marked dirty
    /// meanwhile.
    pub fn done(&self, item: &ObjectRef) {
        let requeue = {
            let mut state = self.lock();
            state.in_flight.remove(item);
            state.dirty.remove(item)
        };
        if requeue {
            self.enqueue(item.clone());
        }
    }

    /// Records a failure and returns how many in a row `item` has had.
    fn record_failure(&self, item: &ObjectRef) -> u32 {
        let mut state = self.lock();
        let count = state.failures.entry(item.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget_failures(&self, item: &ObjectRef) {
        self.lock().failures.remove(item);
    }

    /// Records a stale-mirror removal and returns how many `item` has had
    /// since it last converged.
    fn record_stale(&self, item: &ObjectRef) -> u32 {
        let mut state = self.lock();
        let count = state.stale.entry(item.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget_stale(&self, item: &ObjectRef) {
        self.lock().stale.remove(item);
    }

    /// Identities waiting to be picked up.
    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}

/// Counters exposed through the agent status command.
#[derive(Debug, Default)]
pub struct DispatchStats {
    reconciled: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchCounts {
    pub reconciled: u64,
    pub failed: u64,
    pub requeued: u64,
}

impl DispatchStats {
    pub fn counts(&self) -> DispatchCounts {
        DispatchCounts {
            reconciled: self.reconciled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// Runs reconciles for queued identities on `workers` concurrent tasks.
pub struct Dispatcher {
    engine: SyncEngine,
    queue: Arc<WorkQueue>,
    stats: Arc<DispatchStats>,
    workers: usize,
    backoff: Backoff,
}

impl Dispatcher {
    pub fn new(engine: SyncEngine, workers: usize) -> Self {
        Self {
            engine,
            queue: Arc::new(WorkQueue::new()),
            stats: Arc::new(DispatchStats::default()),
            workers: workers.max(1),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Drains the queue until `shutdown` closes.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), AgentError> {
        let mut handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let worker = Worker {
                id,
                engine: self.engine.clone(),
                queue: self.queue.clone(),
                stats: self.stats.clone(),
                backoff: self.backoff,
                shutdown: shutdown.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        tracing::info!(workers = self.workers, "dispatcher started");
        for handle in handles {
            handle.await.map_err(|err| join_err("dispatch worker", err))?;
        }
        tracing::info!("dispatcher stopped");
        Ok(())
    }
}

struct Worker {
    id: usize,
    engine: SyncEngine,
    queue: Arc<WorkQueue>,
    stats: Arc<DispatchStats>,
    backoff: Backoff,
    shutdown: ShutdownSignal,
}

impl Worker {
    async fn run(self) {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.closed() => break,
                item = self.queue.next() => item,
            };
            self.process(item).await;
        }
        tracing::debug!(worker = self.id, "dispatch worker stopped");
    }

    async fn process(&self, item: ObjectRef) {
        let engine = self.engine.clone();
        let (kind, key) = item.clone();
        let result = tokio::task::spawn_blocking(move || engine.reconcile(kind, &key)).await;

        let (kind, key) = (&item.0, &item.1);
        let retry_after = match result {
            Ok(Ok(outcome)) => {
                self.stats.reconciled.fetch_add(1, Ordering::Relaxed);
                self.queue.forget_failures(&item);
                if outcome.is_change() {
                    tracing::info!(worker = self.id, kind = %kind, key = %key, outcome = ?outcome, "reconciled");
                } else {
                    tracing::debug!(worker = self.id, kind = %kind, key = %key, outcome = ?outcome, "reconciled");
                }
                self.requeue_delay(&item, &outcome)
            }
            Ok(Err(err)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let failures = self.queue.record_failure(&item);
                let delay = self.backoff.delay(failures);
                tracing::warn!(
                    worker = self.id,
                    kind = %kind,
                    key = %key,
                    error = %err,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile failed",
                );
                Some(delay)
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let failures = self.queue.record_failure(&item);
                tracing::error!(worker = self.id, kind = %kind, key = %key, error = %err, "reconcile task failed");
                Some(self.backoff.delay(failures))
            }
        };

        self.queue.done(&item);
        match retry_after {
            Some(delay) => {
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                let queue = self.queue.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = shutdown.closed() => {}
                        _ = tokio::time::sleep(delay) => queue.enqueue(item),
                    }
                });
            }
            None => {}
        }
    }

    /// Delay before reconciling `item` again after a successful pass.
    fn requeue_delay(&self, item: &ObjectRef, outcome: &SyncOutcome) -> Option<Duration> {
        if outcome.needs_requeue() {
            let removals = self.queue.record_stale(item);
            if removals > 1 {
                tracing::warn!(
                    worker = self.id,
                    kind = %item.0,
                    key = %item.1,
                    removals,
                    "mirror removed as stale again; pivot and member clocks may disagree",
                );
            }
            return Some(self.backoff.delay(removals));
        }
        // The recreate that follows a stale removal has not converged yet.
        if !matches!(outcome, SyncOutcome::Created) {
            self.queue.forget_stale(item);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::{keys, DeletePolicy, MemoryStore, Resource, ResourceStore};

    use super::*;

    fn item(name: &str) -> ObjectRef {
        (ResourceKind::User, ObjectKey::cluster_scoped(name))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(1600));
        assert_eq!(backoff.delay(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn queue_dedups_pending_and_in_flight_items() {
        let queue = WorkQueue::new();
        queue.enqueue(item("a"));
        queue.enqueue(item("a"));
        queue.enqueue(item("b"));
        assert_eq!(queue.len(), 2);

        let first = queue.next().await;
        assert_eq!(first, item("a"));
        assert_eq!(queue.in_flight(), 1);

        // In flight: marked dirty instead of queued twice.
        queue.enqueue(item("a"));
        queue.enqueue(item("a"));
        assert_eq!(queue.len(), 1);

        queue.done(&first);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.next().await, item("b"));
        assert_eq!(queue.next().await, item("a"));
    }

    #[tokio::test]
    async fn done_without_dirty_mark_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.enqueue(item("a"));
        let a = queue.next().await;
        queue.done(&a);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatcher_converges_queued_identities() {
        let pivot = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryStore::with_delete_policy(DeletePolicy::ProtectTenancy));
        for name in ["alice", "bob"] {
            pivot
                .create(
                    &Resource::new(ResourceKind::User, ObjectKey::cluster_scoped(name))
                        .with_annotation(keys::SYNC, "true"),
                )
                .expect("pivot");
        }

        let dispatcher = Dispatcher::new(SyncEngine::new(pivot, local.clone()), 2);
        let queue = dispatcher.queue();
        let stats = dispatcher.stats();
        for _ in 0..3 {
            queue.enqueue(item("alice"));
            queue.enqueue(item("bob"));
        }
        let shutdown = ShutdownSignal::new();
        let running = tokio::spawn(dispatcher.run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while local.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("mirrors created");

        shutdown.close();
        running.await.expect("join").expect("dispatcher");
        assert_eq!(stats.counts().reconciled, 2);
        assert_eq!(stats.counts().failed, 0);
    }

    fn worker(backoff: Backoff) -> Worker {
        let engine = SyncEngine::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
        Worker {
            id: 0,
            engine,
            queue: Arc::new(WorkQueue::new()),
            stats: Arc::new(DispatchStats::default()),
            backoff,
            shutdown: ShutdownSignal::new(),
        }
    }

    #[test]
    fn repeated_stale_removals_back_off_until_converged() {
        let worker = worker(Backoff::default());
        let a = item("a");
        let stale = SyncOutcome::StaleRemoved;

        assert_eq!(worker.requeue_delay(&a, &stale), Some(Duration::from_millis(200)));
        // Recreated, then found stale again: the mirror never converged.
        assert_eq!(worker.requeue_delay(&a, &SyncOutcome::Created), None);
        assert_eq!(worker.requeue_delay(&a, &stale), Some(Duration::from_millis(400)));
        assert_eq!(worker.requeue_delay(&a, &stale), Some(Duration::from_millis(800)));

        assert_eq!(worker.requeue_delay(&a, &SyncOutcome::InSync), None);
        assert_eq!(worker.requeue_delay(&a, &stale), Some(Duration::from_millis(200)));
        // Counts are per identity.
        assert_eq!(worker.requeue_delay(&item("b"), &stale), Some(Duration::from_millis(200)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_mirror_is_recreated_after_a_delay() {
        let pivot = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryStore::new());
        let key = ObjectKey::cluster_scoped("alice");
        let mut namesake = Resource::new(ResourceKind::User, key.clone());
        namesake.metadata.creation_timestamp =
            Some(chrono::Utc::now() - chrono::Duration::hours(2));
        local.seed(namesake).expect("seed");
        pivot
            .create(
                &Resource::new(ResourceKind::User, key.clone()).with_annotation(keys::SYNC, "true"),
            )
            .expect("pivot");

        let backoff = Backoff {
            base: Duration::from_millis(150),
            ..Backoff::default()
        };
        let dispatcher =
            Dispatcher::new(SyncEngine::new(pivot, local.clone()), 1).with_backoff(backoff);
        let stats = dispatcher.stats();
        dispatcher.queue().enqueue(item("alice"));
        let started = std::time::Instant::now();
        let shutdown = ShutdownSignal::new();
        let running = tokio::spawn(dispatcher.run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.counts().reconciled < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("recreated");
        assert!(started.elapsed() >= Duration::from_millis(150));

        shutdown.close();
        running.await.expect("join").expect("dispatcher");
        assert_eq!(stats.counts().requeued, 1);
        let mirror = local.get(ResourceKind::User, &key).expect("mirror");
        let recent = chrono::Utc::now() - chrono::Duration::hours(1);
        assert!(mirror.metadata.creation_timestamp > Some(recent));
    }
}
