//! The declarative resource store contract.
//!
//! Both the pivot and every member expose the same store interface:
//! get / list / create / update / delete plus a status-only write path.
//! Writes are guarded by the object's `resource_version`; a stale or missing
//! version on update is rejected with [`StoreError::Conflict`].
//!
//! The helpers at the bottom implement the write semantics shared by
//! [`MemoryStore`](crate::memory::MemoryStore) and
//! [`FileStore`](crate::file_store::FileStore).

use std::sync::Arc;

use chrono::Utc;

use crate::error::StoreError;
use crate::selector::LabelSelector;
use crate::types::{ObjectKey, Resource, ResourceKind};

/// A versioned object store.
///
/// Implementations are blocking; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait ResourceStore: Send + Sync {
    fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<Resource, StoreError>;

    /// All objects of `kind` whose labels match `selector`, sorted by key.
    fn list(&self, kind: ResourceKind, selector: &LabelSelector)
        -> Result<Vec<Resource>, StoreError>;

    /// Stores a new object. Store-assigned fields on the input are ignored.
    fn create(&self, resource: &Resource) -> Result<Resource, StoreError>;

    /// Replaces metadata and spec. Status is left untouched.
    fn update(&self, resource: &Resource) -> Result<Resource, StoreError>;

    /// Replaces status only.
    fn update_status(&self, resource: &Resource) -> Result<Resource, StoreError>;

    fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError>;
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn ResourceStore>;

/// Admission rule refusing deletes of protected kinds unless the
/// force-delete annotation is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    #[default]
    Allow,
    ProtectTenancy,
}

impl DeletePolicy {
    pub fn admit(self, stored: &Resource) -> Result<(), StoreError> {
        if self == DeletePolicy::ProtectTenancy
            && stored.kind.is_delete_protected()
            && !stored.force_delete_requested()
        {
            return Err(StoreError::Forbidden {
                kind: stored.kind,
                key: stored.key(),
                reason: format!(
                    "{} objects may only be deleted with the {} annotation",
                    stored.kind,
                    crate::types::keys::FORCE_DELETE
                ),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared write semantics
// ---------------------------------------------------------------------------

pub(crate) fn validate_scope(kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError> {
    let reason = if key.name.is_empty() {
        Some("name must not be empty")
    } else if key.name.contains('/') {
        Some("name must not contain '/'")
    } else if kind.is_namespaced() && key.namespace.is_none() {
        Some("namespaced kind requires a namespace")
    } else if !kind.is_namespaced() && key.namespace.is_some() {
        Some("cluster-scoped kind must not carry a namespace")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StoreError::Invalid {
            kind,
            key: key.clone(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// New object as it will be stored under `version`.
pub(crate) fn prepare_create(resource: &Resource, version: u64) -> Resource {
    let mut stored = resource.clone();
    stored.metadata.uid = Some(format!("{}-{version:08x}", resource.kind.as_str()));
    stored.metadata.resource_version = Some(version);
    stored.metadata.creation_timestamp = Some(Utc::now());
    stored
}

pub(crate) fn check_version(stored: &Resource, incoming: &Resource) -> Result<(), StoreError> {
    let actual = stored.metadata.resource_version.unwrap_or_default();
    if incoming.metadata.resource_version != Some(actual) {
        return Err(StoreError::Conflict {
            kind: stored.kind,
            key: stored.key(),
            expected: incoming.metadata.resource_version,
            actual,
        });
    }
    Ok(())
}

/// Metadata + spec replacement. Identity fields stay with the store.
pub(crate) fn prepare_update(stored: &Resource, incoming: &Resource, version: u64) -> Resource {
    let mut next = incoming.clone();
    next.metadata.uid = stored.metadata.uid.clone();
    next.metadata.creation_timestamp = stored.metadata.creation_timestamp;
    next.metadata.resource_version = Some(version);
    next.status = stored.status.clone();
    next
}

pub(crate) fn prepare_status(stored: &Resource, incoming: &Resource, version: u64) -> Resource {
    let mut next = stored.clone();
    next.status = incoming.status.clone();
    next.metadata.resource_version = Some(version);
    next
}
