//! Unified YAML diff between a pivot object and its local mirror, for
//! `fleet diff`.

use similar::TextDiff;

use fleet_core::{ObjectKey, Resource, ResourceKind};

use crate::engine::SyncEngine;
use crate::scope::strip_for_local;
use crate::SyncError;

/// Diff for one identity. `unified_diff` is empty when both sides agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDiff {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub unified_diff: String,
}

impl ObjectDiff {
    pub fn is_empty(&self) -> bool {
        self.unified_diff.is_empty()
    }
}

/// Compare what the engine would write locally against the current mirror.
///
/// Store-assigned fields are left out of both sides so only replicated
/// content shows up. A missing object on either side diffs against an
/// empty document. Nothing is written.
pub fn diff_object(
    engine: &SyncEngine,
    kind: ResourceKind,
    key: &ObjectKey,
) -> Result<ObjectDiff, SyncError> {
    let desired = fetch(engine.pivot().get(kind, key))?.map(|r| strip_for_local(&r));
    let current = fetch(engine.local().get(kind, key))?.map(|mut r| {
        r.clear_store_fields();
        r
    });

    let old = render(current.as_ref())?;
    let new = render(desired.as_ref())?;
    let unified_diff = if old == new {
        String::new()
    } else {
        let name = format!("{kind}/{key}");
        TextDiff::from_lines(&old, &new)
            .unified_diff()
            .header(&format!("local/{name}"), &format!("pivot/{name}"))
            .context_radius(3)
            .to_string()
    };

    Ok(ObjectDiff {
        kind,
        key: key.clone(),
        unified_diff,
    })
}

fn fetch(result: Result<Resource, fleet_core::StoreError>) -> Result<Option<Resource>, SyncError> {
    match result {
        Ok(resource) => Ok(Some(resource)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn render(resource: Option<&Resource>) -> Result<String, SyncError> {
    match resource {
        Some(resource) => Ok(serde_yaml::to_string(resource)?),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fleet_core::{keys, MemoryStore, ResourceStore};

    use super::*;

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryStore>, SyncEngine) {
        let pivot = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(pivot.clone(), local.clone());
        (pivot, local, engine)
    }

    fn role() -> Resource {
        Resource::new(ResourceKind::ClusterRole, ObjectKey::cluster_scoped("viewer"))
            .with_annotation(keys::SYNC, "true")
            .with_spec(serde_json::json!({"rules": ["get"]}))
    }

    #[test]
    fn no_diff_after_reconcile() {
        let (pivot, _local, engine) = setup();
        let created = pivot.create(&role()).expect("pivot");
        engine
            .reconcile(created.kind, &created.key())
            .expect("reconcile");

        let diff = diff_object(&engine, created.kind, &created.key()).expect("diff");
        assert!(diff.is_empty(), "unexpected diff:\n{}", diff.unified_diff);
    }

    #[test]
    fn pivot_edit_shows_in_unified_diff() {
        let (pivot, _local, engine) = setup();
        let created = pivot.create(&role()).expect("pivot");
        engine
            .reconcile(created.kind, &created.key())
            .expect("reconcile");
        pivot
            .update(&created.with_spec(serde_json::json!({"rules": ["get", "list"]})))
            .expect("edit");

        let key = ObjectKey::cluster_scoped("viewer");
        let diff = diff_object(&engine, ResourceKind::ClusterRole, &key).expect("diff");
        assert!(diff.unified_diff.contains("--- local/cluster-role/viewer"));
        assert!(diff.unified_diff.contains("+++ pivot/cluster-role/viewer"));
        assert!(diff
            .unified_diff
            .lines()
            .any(|line| line.starts_with('+') && line.contains("- list")));
    }

    #[test]
    fn missing_mirror_diffs_against_empty() {
        let (pivot, local, engine) = setup();
        let created = pivot.create(&role()).expect("pivot");
        let diff = diff_object(&engine, created.kind, &created.key()).expect("diff");
        assert!(diff.unified_diff.contains("+kind: cluster-role"));
        assert!(local.is_empty());
    }
}
