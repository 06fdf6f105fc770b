//! One-way pivot → member reconciliation.
//!
//! ## `reconcile`: per-identity protocol
//!
//! 1. Read the object from the pivot store.
//! 2. Absent upstream → delete the local mirror. Delete-protected kinds are
//!    first stamped with the force-delete annotation so the member's
//!    admission rule lets the delete through.
//! 3. Present upstream → strip store-assigned fields, then read the mirror:
//!    - absent locally → create it;
//!    - present, and the pivot object was created after it → the mirror is
//!      an out-of-band namesake: delete it and ask for a requeue;
//!    - present, pivot tracking version strictly greater → overwrite,
//!      keeping the mirror's own identity fields;
//!    - otherwise in sync, nothing written.
//!
//! "Not found" anywhere on the delete/create race paths counts as success.

use fleet_core::{
    keys, store::SharedStore, ObjectKey, Resource, ResourceKind, StalenessCheck, StoreError,
};

use crate::scope::{in_scope, strip_for_local, tracking_version};
use crate::SyncError;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A write the engine would perform in dry-run mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Create,
    Update { from: u64, to: u64 },
    Delete,
}

/// Result of reconciling one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Mirror did not exist and was created.
    Created,
    /// Mirror was overwritten with a newer pivot version.
    Updated { from: u64, to: u64 },
    /// Mirror already carries the pivot version (or a newer one).
    InSync,
    /// Pivot object is gone; mirror removed.
    Deleted,
    /// Pivot object is gone and so is the mirror.
    AlreadyAbsent,
    /// Mirror predates the pivot object and was removed; reconcile again to
    /// recreate it.
    StaleRemoved,
    /// `dry_run`: the write that would have been issued.
    WouldApply(PlannedAction),
}

impl SyncOutcome {
    /// Whether the caller should schedule another reconcile of the identity.
    pub fn needs_requeue(&self) -> bool {
        matches!(self, SyncOutcome::StaleRemoved)
    }

    /// Whether the local store was (or would be) written.
    pub fn is_change(&self) -> bool {
        !matches!(self, SyncOutcome::InSync | SyncOutcome::AlreadyAbsent)
    }
}

/// Reconcile outcome tagged with the identity it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectResult {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub outcome: SyncOutcome,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOptions {
    pub staleness: StalenessCheck,
    pub dry_run: bool,
}

/// Mirrors pivot objects into the local store. Holds no per-identity state:
/// every call re-derives its decision from the two stores.
#[derive(Clone)]
pub struct SyncEngine {
    pivot: SharedStore,
    local: SharedStore,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(pivot: SharedStore, local: SharedStore) -> Self {
        Self {
            pivot,
            local,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    pub fn pivot(&self) -> &SharedStore {
        &self.pivot
    }

    pub fn local(&self) -> &SharedStore {
        &self.local
    }

    /// Reconcile the mirror of `(kind, key)` against the pivot.
    pub fn reconcile(&self, kind: ResourceKind, key: &ObjectKey) -> Result<SyncOutcome, SyncError> {
        let upstream = match self.pivot.get(kind, key) {
            Ok(upstream) => upstream,
            Err(err) if err.is_not_found() => {
                tracing::debug!("{kind} {key} absent upstream; removing mirror");
                return self.remove_mirror(kind, key);
            }
            Err(err) => return Err(err.into()),
        };

        if !in_scope(&upstream) {
            return self.remove_out_of_scope(kind, key);
        }

        let desired = strip_for_local(&upstream);
        let existing = match self.local.get(kind, key) {
            Ok(existing) => existing,
            Err(err) if err.is_not_found() => return self.create_mirror(&desired),
            Err(err) => return Err(err.into()),
        };

        if self.is_stale(&upstream, &existing) {
            tracing::info!(
                "{kind} {key} mirror predates the pivot object; removing out-of-band namesake"
            );
            return match self.remove_mirror(kind, key)? {
                SyncOutcome::Deleted => Ok(SyncOutcome::StaleRemoved),
                other => Ok(other),
            };
        }

        let incoming = tracking_version(&desired)?;
        let current = tracking_version(&existing)?;
        if incoming <= current {
            tracing::debug!("{kind} {key} in sync at version {current}");
            return Ok(SyncOutcome::InSync);
        }

        if self.options.dry_run {
            tracing::info!("[dry-run] would update {kind} {key} ({current} -> {incoming})");
            return Ok(SyncOutcome::WouldApply(PlannedAction::Update {
                from: current,
                to: incoming,
            }));
        }

        let status = desired.status.clone();
        let mut next = desired;
        next.adopt_store_fields(&existing);
        let mut written = self.local.update(&next)?;
        // `update` keeps the stored status; carry the pivot's over explicitly.
        if written.status != status {
            written.status = status;
            self.local.update_status(&written)?;
        }
        tracing::info!("updated {kind} {key} ({current} -> {incoming})");
        Ok(SyncOutcome::Updated {
            from: current,
            to: incoming,
        })
    }

    fn create_mirror(&self, desired: &Resource) -> Result<SyncOutcome, SyncError> {
        let (kind, key) = (desired.kind, desired.key());
        if self.options.dry_run {
            tracing::info!("[dry-run] would create {kind} {key}");
            return Ok(SyncOutcome::WouldApply(PlannedAction::Create));
        }
        self.local.create(desired)?;
        tracing::info!("created {kind} {key}");
        Ok(SyncOutcome::Created)
    }

    fn remove_mirror(&self, kind: ResourceKind, key: &ObjectKey) -> Result<SyncOutcome, SyncError> {
        if self.options.dry_run {
            return match self.local.get(kind, key) {
                Ok(_) => {
                    tracing::info!("[dry-run] would delete {kind} {key}");
                    Ok(SyncOutcome::WouldApply(PlannedAction::Delete))
                }
                Err(err) if err.is_not_found() => Ok(SyncOutcome::AlreadyAbsent),
                Err(err) => Err(err.into()),
            };
        }
        Ok(delete_mirror(&self.local, kind, key)?)
    }

    // Only touches the local object when it is itself a mirror, so locally
    // owned namesakes of unreplicated pivot objects are left alone.
    fn remove_out_of_scope(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
    ) -> Result<SyncOutcome, SyncError> {
        match self.local.get(kind, key) {
            Ok(existing) if in_scope(&existing) => {
                tracing::info!("{kind} {key} left replication scope; removing mirror");
                self.remove_mirror(kind, key)
            }
            Ok(_) => Ok(SyncOutcome::InSync),
            Err(err) if err.is_not_found() => Ok(SyncOutcome::AlreadyAbsent),
            Err(err) => Err(err.into()),
        }
    }

    fn is_stale(&self, upstream: &Resource, existing: &Resource) -> bool {
        match self.options.staleness {
            StalenessCheck::Disabled => false,
            StalenessCheck::PivotNewer => match (
                upstream.metadata.creation_timestamp,
                existing.metadata.creation_timestamp,
            ) {
                (Some(pivot_created), Some(local_created)) => pivot_created > local_created,
                _ => false,
            },
        }
    }
}

/// Delete a local mirror, stamping delete-protected kinds with the
/// force-delete annotation first. Absence at any step counts as success.
pub fn delete_mirror(
    local: &SharedStore,
    kind: ResourceKind,
    key: &ObjectKey,
) -> Result<SyncOutcome, StoreError> {
    if kind.is_delete_protected() {
        let mut mirror = match local.get(kind, key) {
            Ok(mirror) => mirror,
            Err(err) if err.is_not_found() => return Ok(SyncOutcome::AlreadyAbsent),
            Err(err) => return Err(err),
        };
        if !mirror.force_delete_requested() {
            mirror
                .metadata
                .annotations
                .insert(keys::FORCE_DELETE.to_string(), "true".to_string());
            match local.update(&mirror) {
                Ok(_) => tracing::debug!("stamped {kind} {key} for forced deletion"),
                Err(err) if err.is_not_found() => return Ok(SyncOutcome::AlreadyAbsent),
                Err(err) => return Err(err),
            }
        }
    }

    match local.delete(kind, key) {
        Ok(()) => {
            tracing::info!("deleted {kind} {key}");
            Ok(SyncOutcome::Deleted)
        }
        Err(err) if err.is_not_found() => Ok(SyncOutcome::AlreadyAbsent),
        Err(err) => Err(err),
    }
}
