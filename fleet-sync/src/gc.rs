//! Orphan sweep: removes local mirrors whose pivot object no longer exists.
//!
//! The sweep never aborts. Per-object failures are logged and counted, and
//! a mirror is only deleted after the pivot has positively answered "not
//! found" for it.

use serde::Serialize;

use fleet_core::{store::SharedStore, LabelSelector, ObjectKey, ResourceKind};

use crate::engine::{delete_mirror, SyncOutcome};
use crate::scope::in_scope;

/// Counters for one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Local mirrors examined.
    pub checked: usize,
    /// Orphans removed (or, in dry-run mode, that would be removed).
    pub deleted: usize,
    /// Mirrors whose pivot object still exists.
    pub kept: usize,
    /// Mirrors left untouched because the pivot lookup failed, with reasons.
    pub skipped: Vec<String>,
    /// Deletes or listings that failed.
    pub failed: Vec<String>,
    pub dry_run: bool,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Walks every replicated kind in the local store and deletes orphaned
/// mirrors.
pub struct Sweeper {
    pivot: SharedStore,
    local: SharedStore,
    dry_run: bool,
}

impl Sweeper {
    pub fn new(pivot: SharedStore, local: SharedStore) -> Self {
        Self {
            pivot,
            local,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// One full pass over [`ResourceKind::replicated`].
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            dry_run: self.dry_run,
            ..SweepReport::default()
        };
        for kind in ResourceKind::replicated() {
            self.sweep_kind(*kind, &mut report);
        }
        tracing::info!(
            "gc pass: checked={} deleted={} kept={} skipped={} failed={}",
            report.checked,
            report.deleted,
            report.kept,
            report.skipped.len(),
            report.failed.len()
        );
        report
    }

    fn sweep_kind(&self, kind: ResourceKind, report: &mut SweepReport) {
        let mirrors = match self.local.list(kind, &LabelSelector::everything()) {
            Ok(items) => items,
            Err(err) => {
                let message = format!("listing local {kind} failed: {err}");
                tracing::warn!("gc: {message}");
                report.failed.push(message);
                return;
            }
        };

        for mirror in mirrors.iter().filter(|m| in_scope(m)) {
            report.checked += 1;
            self.sweep_one(kind, &mirror.key(), report);
        }
    }

    fn sweep_one(&self, kind: ResourceKind, key: &ObjectKey, report: &mut SweepReport) {
        match self.pivot.get(kind, key) {
            Ok(_) => {
                report.kept += 1;
                return;
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                let message = format!("{kind} {key}: pivot lookup failed: {err}");
                tracing::warn!("gc: skipping {message}");
                report.skipped.push(message);
                return;
            }
        }

        if self.dry_run {
            tracing::info!("[dry-run] gc would remove orphan {kind} {key}");
            report.deleted += 1;
            return;
        }

        match delete_mirror(&self.local, kind, key) {
            Ok(SyncOutcome::Deleted) => {
                tracing::info!("gc: removed orphan {kind} {key}");
                report.deleted += 1;
            }
            Ok(_) => tracing::debug!("gc: {kind} {key} already gone"),
            Err(err) => {
                let message = format!("deleting {kind} {key} failed: {err}");
                tracing::warn!("gc: {message}");
                report.failed.push(message);
            }
        }
    }
}
