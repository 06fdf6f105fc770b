//! Replication scope and local-write preparation.
//!
//! An object is in scope when its sync annotation parses to `true` and it
//! does not carry the namespace-inheritance label. The same predicate gates
//! watch events, the reconcile path and the orphan sweep.

use fleet_core::{keys, types::parse_bool, Resource};

use crate::SyncError;

/// `true` when `resource` should be mirrored to member clusters.
pub fn in_scope(resource: &Resource) -> bool {
    let opted_in = resource
        .annotation(keys::SYNC)
        .and_then(parse_bool)
        .unwrap_or(false);
    opted_in && resource.label(keys::INHERITED_FROM).is_none()
}

/// Turns a pivot object into the body written to the local store.
///
/// Records the pivot version in the tracking annotation, drops the
/// last-applied annotation and clears every store-assigned field.
pub fn strip_for_local(pivot: &Resource) -> Resource {
    let mut local = pivot.clone();
    if let Some(version) = pivot.metadata.resource_version {
        local
            .metadata
            .annotations
            .insert(keys::SYNC_VERSION.to_string(), version.to_string());
    }
    local.metadata.annotations.remove(keys::LAST_APPLIED);
    local.clear_store_fields();
    local
}

/// Tracking version carried by `resource`.
///
/// A missing annotation reads as `0`, so any replicated version takes
/// precedence over an object that was never written by the engine.
pub fn tracking_version(resource: &Resource) -> Result<u64, SyncError> {
    let Some(raw) = resource.annotation(keys::SYNC_VERSION) else {
        return Ok(0);
    };
    raw.trim()
        .parse::<u64>()
        .map_err(|source| SyncError::MalformedTracking {
            kind: resource.kind,
            key: resource.key(),
            value: raw.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{ObjectKey, ResourceKind};

    fn binding() -> Resource {
        Resource::new(ResourceKind::RoleBinding, ObjectKey::namespaced("dev", "r1"))
    }

    #[test]
    fn scope_requires_true_sync_annotation() {
        assert!(!in_scope(&binding()));
        assert!(in_scope(&binding().with_annotation(keys::SYNC, "true")));
        assert!(in_scope(&binding().with_annotation(keys::SYNC, "1")));
        assert!(!in_scope(&binding().with_annotation(keys::SYNC, "false")));
        assert!(!in_scope(&binding().with_annotation(keys::SYNC, "yes")));
    }

    #[test]
    fn inherited_objects_are_out_of_scope() {
        let inherited = binding()
            .with_annotation(keys::SYNC, "true")
            .with_label(keys::INHERITED_FROM, "parent-ns");
        assert!(!in_scope(&inherited));
    }

    #[test]
    fn strip_records_version_and_clears_identity() {
        let mut pivot = binding()
            .with_annotation(keys::SYNC, "true")
            .with_annotation(keys::LAST_APPLIED, "{...}");
        pivot.metadata.uid = Some("pivot-uid".into());
        pivot.metadata.resource_version = Some(42);
        pivot.metadata.creation_timestamp = Some(chrono::Utc::now());

        let local = strip_for_local(&pivot);
        assert_eq!(local.annotation(keys::SYNC_VERSION), Some("42"));
        assert_eq!(local.annotation(keys::LAST_APPLIED), None);
        assert_eq!(local.annotation(keys::SYNC), Some("true"));
        assert!(local.metadata.uid.is_none());
        assert!(local.metadata.resource_version.is_none());
        assert!(local.metadata.creation_timestamp.is_none());
    }

    #[test]
    fn strip_overwrites_inherited_tracking_value() {
        let mut pivot = binding().with_annotation(keys::SYNC_VERSION, "3");
        pivot.metadata.resource_version = Some(9);
        assert_eq!(tracking_version(&strip_for_local(&pivot)).expect("version"), 9);
    }

    #[test]
    fn tracking_version_parses_or_errors() {
        assert_eq!(tracking_version(&binding()).expect("missing"), 0);
        let ok = binding().with_annotation(keys::SYNC_VERSION, "17");
        assert_eq!(tracking_version(&ok).expect("parse"), 17);
        let bad = binding().with_annotation(keys::SYNC_VERSION, "seventeen");
        let err = tracking_version(&bad).unwrap_err();
        assert!(matches!(err, SyncError::MalformedTracking { .. }), "got: {err}");
        assert!(err.to_string().contains("seventeen"));
    }
}
