//! Pivot store watcher: turns file events under the pivot store root into
//! reconcile requests, and periodically resyncs everything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use fleet_core::{file_store::identify_path, LabelSelector, Resource, ResourceKind};
use fleet_sync::{in_scope, SyncEngine};

use crate::dispatch::{ObjectRef, WorkQueue};
use crate::error::{io_err, join_err, AgentError};
use crate::signal::ShutdownSignal;

/// Quiet period an identity needs before its events are delivered.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Trailing-edge debouncer: every event pushes the identity's deadline out
/// by the window; identities are released once their deadline passes.
#[derive(Debug, Default)]
pub struct Debouncer {
    deadlines: HashMap<ObjectRef, Instant>,
}

impl Debouncer {
    pub fn touch(&mut self, item: ObjectRef, now: Instant, window: Duration) {
        self.deadlines.insert(item, now + window);
    }

    /// Identities whose quiet period has elapsed at `now`.
    pub fn due(&mut self, now: Instant) -> Vec<ObjectRef> {
        let mut ready = Vec::new();
        self.deadlines.retain(|item, deadline| {
            if *deadline <= now {
                ready.push(item.clone());
                false
            } else {
                true
            }
        });
        ready.sort();
        ready
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Watches the pivot store directory and feeds the dispatcher.
pub struct PivotWatcher {
    root: PathBuf,
    engine: SyncEngine,
    queue: Arc<WorkQueue>,
    resync: Duration,
    /// Last object seen per identity; answers the predicate for removals.
    cache: HashMap<ObjectRef, Resource>,
}

impl PivotWatcher {
    pub fn new(root: PathBuf, engine: SyncEngine, queue: Arc<WorkQueue>, resync: Duration) -> Self {
        Self {
            root,
            engine,
            queue,
            resync,
            cache: HashMap::new(),
        }
    }

    pub async fn run(mut self, shutdown: ShutdownSignal) -> Result<(), AgentError> {
        std::fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
        // inotify reports canonical paths; match them against a canonical root.
        let root = std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        tracing::info!(path = %root.display(), "watching pivot store");

        let mut debounce = Debouncer::default();
        let mut flush = tokio::time::interval(DEBOUNCE_WINDOW / 2);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut resync = tokio::time::interval(self.resync);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.closed() => break,
                _ = resync.tick() => {
                    if let Err(err) = self.resync_all().await {
                        tracing::warn!(error = %err, "pivot resync failed");
                    }
                }
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let event = match event {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::warn!(error = %err, "watcher event error");
                            continue;
                        }
                    };
                    if !is_relevant_event_kind(&event.kind) {
                        continue;
                    }
                    let now = Instant::now();
                    for item in event.paths.iter().filter_map(|p| object_for_path(&root, p)) {
                        debounce.touch(item, now, DEBOUNCE_WINDOW);
                    }
                }
                _ = flush.tick(), if !debounce.is_empty() => {
                    for item in debounce.due(Instant::now()) {
                        if let Err(err) = self.deliver(item).await {
                            tracing::warn!(error = %err, "watch event dropped");
                        }
                    }
                }
            }
        }
        drop(watcher);
        Ok(())
    }

    /// Applies the replication predicate to the current object (or, once it
    /// is gone, to the last one seen) and enqueues the identity if it passes.
    async fn deliver(&mut self, item: ObjectRef) -> Result<(), AgentError> {
        let pivot = self.engine.pivot().clone();
        let (kind, key) = item.clone();
        let current = tokio::task::spawn_blocking(move || pivot.get(kind, &key))
            .await
            .map_err(|err| join_err("pivot read", err))?;

        let passes = match current {
            Ok(object) => {
                let was = self.cache.get(&item).map(in_scope).unwrap_or(false);
                let passes = was || in_scope(&object);
                self.cache.insert(item.clone(), object);
                passes
            }
            Err(err) if err.is_not_found() => {
                self.cache.remove(&item).map(|r| in_scope(&r)).unwrap_or(false)
            }
            Err(err) => return Err(err.into()),
        };

        if passes {
            tracing::debug!(kind = %item.0, key = %item.1, "enqueue from watch event");
            self.queue.enqueue(item);
        }
        Ok(())
    }

    /// Enqueues every in-scope pivot object and every local mirror, and
    /// refreshes the predicate cache.
    async fn resync_all(&mut self) -> Result<(), AgentError> {
        let engine = self.engine.clone();
        let (pivot_objects, mirrors) = tokio::task::spawn_blocking(move || {
            let everything = LabelSelector::everything();
            let mut pivot_objects = Vec::new();
            let mut mirrors = Vec::new();
            for kind in ResourceKind::replicated() {
                pivot_objects.extend(engine.pivot().list(*kind, &everything)?);
                mirrors.extend(engine.local().list(*kind, &everything)?);
            }
            Ok::<_, fleet_core::StoreError>((pivot_objects, mirrors))
        })
        .await
        .map_err(|err| join_err("pivot resync", err))??;

        self.cache.clear();
        let mut enqueued = 0usize;
        for object in pivot_objects {
            let item = (object.kind, object.key());
            if in_scope(&object) {
                self.queue.enqueue(item.clone());
                enqueued += 1;
            }
            self.cache.insert(item, object);
        }
        for mirror in mirrors.iter().filter(|m| in_scope(m)) {
            self.queue.enqueue((mirror.kind, mirror.key()));
        }
        tracing::debug!(enqueued, mirrors = mirrors.len(), "pivot resync queued");
        Ok(())
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Replicated-kind identity stored at `path`, if any.
fn object_for_path(root: &Path, path: &Path) -> Option<ObjectRef> {
    let (kind, key) = identify_path(root, path)?;
    kind.is_replicated().then_some((kind, key))
}
