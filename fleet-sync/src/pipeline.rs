//! One-shot reconcile of a whole scope, used by `fleet sync`.

use std::collections::BTreeSet;

use fleet_core::{LabelSelector, ObjectKey, ResourceKind};

use crate::engine::{ObjectResult, SyncEngine};
use crate::scope::in_scope;
use crate::SyncError;

/// Scope for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    /// Every replicated kind.
    All,
    /// A single kind.
    Kind(ResourceKind),
}

impl SyncScope {
    pub fn kinds(&self) -> Vec<ResourceKind> {
        match self {
            SyncScope::All => ResourceKind::replicated().to_vec(),
            SyncScope::Kind(kind) => vec![*kind],
        }
    }
}

/// Outcome of syncing one kind.
#[derive(Debug, Default)]
pub struct KindReport {
    pub results: Vec<ObjectResult>,
    /// Identities whose reconcile returned an error, with the error.
    pub failures: Vec<(ObjectKey, SyncError)>,
}

impl KindReport {
    pub fn changed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_change()).count()
    }
}

/// Identities a reconcile pass over `kind` must visit: every in-scope pivot
/// object plus every local mirror, so deletions are picked up too.
pub fn candidates(engine: &SyncEngine, kind: ResourceKind) -> Result<BTreeSet<ObjectKey>, SyncError> {
    let everything = LabelSelector::everything();
    let mut keys: BTreeSet<ObjectKey> = engine
        .pivot()
        .list(kind, &everything)?
        .iter()
        .filter(|r| in_scope(r))
        .map(|r| r.key())
        .collect();
    keys.extend(
        engine
            .local()
            .list(kind, &everything)?
            .iter()
            .filter(|r| in_scope(r))
            .map(|r| r.key()),
    );
    Ok(keys)
}

/// Run one reconcile pass for `scope`.
///
/// Listing errors abort the run; per-object reconcile errors are collected
/// in the kind's report. An identity whose reconcile asks for a requeue is
/// reconciled once more within the same pass.
pub fn run(
    engine: &SyncEngine,
    scope: SyncScope,
) -> Result<Vec<(ResourceKind, KindReport)>, SyncError> {
    let mut reports = Vec::new();
    for kind in scope.kinds() {
        let mut report = KindReport::default();
        for key in candidates(engine, kind)? {
            let mut outcome = engine.reconcile(kind, &key);
            if matches!(&outcome, Ok(o) if o.needs_requeue()) {
                outcome = engine.reconcile(kind, &key);
            }
            match outcome {
                Ok(outcome) => report.results.push(ObjectResult {
                    kind,
                    key,
                    outcome,
                }),
                Err(err) => {
                    tracing::warn!("sync {kind} {key} failed: {err}");
                    report.failures.push((key, err));
                }
            }
        }
        reports.push((kind, report));
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fleet_core::{keys, MemoryStore, Resource, ResourceStore};

    use crate::engine::SyncOutcome;

    use super::*;

    fn replicable(kind: ResourceKind, key: ObjectKey) -> Resource {
        Resource::new(kind, key).with_annotation(keys::SYNC, "true")
    }

    #[test]
    fn run_on_empty_stores_reports_every_kind() {
        let engine = SyncEngine::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
        let reports = run(&engine, SyncScope::All).expect("run");
        assert_eq!(reports.len(), ResourceKind::replicated().len());
        assert!(reports.iter().all(|(_, r)| r.results.is_empty()));
    }

    #[test]
    fn run_converges_local_to_pivot() {
        let pivot = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryStore::new());
        pivot
            .create(&replicable(ResourceKind::User, ObjectKey::cluster_scoped("alice")))
            .expect("alice");
        pivot
            .create(&Resource::new(ResourceKind::User, ObjectKey::cluster_scoped("private")))
            .expect("private");
        local
            .seed(replicable(ResourceKind::User, ObjectKey::cluster_scoped("orphan")))
            .expect("orphan");

        let engine = SyncEngine::new(pivot, local.clone());
        let reports = run(&engine, SyncScope::Kind(ResourceKind::User)).expect("run");
        assert_eq!(reports.len(), 1);
        let (_, report) = &reports[0];
        assert!(report.failures.is_empty());
        assert_eq!(report.changed(), 2);

        let names: Vec<_> = local
            .list(ResourceKind::User, &LabelSelector::everything())
            .expect("list")
            .into_iter()
            .map(|r| r.metadata.name)
            .collect();
        assert_eq!(names, vec!["alice".to_string()]);

        let again = run(&engine, SyncScope::Kind(ResourceKind::User)).expect("rerun");
        assert!(again[0]
            .1
            .results
            .iter()
            .all(|r| r.outcome == SyncOutcome::InSync));
    }

    #[test]
    fn per_object_failures_do_not_stop_the_kind() {
        let pivot = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryStore::new());
        for name in ["a", "b"] {
            pivot
                .create(&replicable(ResourceKind::User, ObjectKey::cluster_scoped(name)))
                .expect("pivot");
        }
        local
            .seed(
                replicable(ResourceKind::User, ObjectKey::cluster_scoped("a"))
                    .with_annotation(keys::SYNC_VERSION, "garbage"),
            )
            .expect("seed");

        let engine = SyncEngine::new(pivot, local).with_options(crate::engine::SyncOptions {
            staleness: fleet_core::StalenessCheck::Disabled,
            dry_run: false,
        });
        let reports = run(&engine, SyncScope::Kind(ResourceKind::User)).expect("run");
        let (_, report) = &reports[0];
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, ObjectKey::cluster_scoped("a"));
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].outcome, SyncOutcome::Created);
    }
}
