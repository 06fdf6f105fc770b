//! `fleet sync`: one reconcile pass over the replicated kinds.

use anyhow::{bail, Context, Result};
use clap::Args;

use fleet_core::ResourceKind;
use fleet_sync::{
    pipeline::{self, KindReport, SyncScope},
    PlannedAction, SyncOutcome,
};

use super::StoreArgs;

/// Arguments for `fleet sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Restrict the pass to one kind (e.g. `role-binding`).
    #[arg(long)]
    pub kind: Option<ResourceKind>,

    /// Show what would change without writing to the local store.
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub stores: StoreArgs,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let stores = self.stores.open()?;
        let engine = stores.engine(self.dry_run);
        let scope = match self.kind {
            Some(kind) => SyncScope::Kind(kind),
            None => SyncScope::All,
        };

        let reports = pipeline::run(&engine, scope).context("sync failed")?;
        let mut failures = 0usize;
        for (kind, report) in &reports {
            print_report(*kind, report, self.dry_run);
            failures += report.failures.len();
        }
        if failures > 0 {
            bail!("{failures} object(s) failed to sync");
        }
        Ok(())
    }
}

fn print_report(kind: ResourceKind, report: &KindReport, dry_run: bool) {
    if report.results.is_empty() && report.failures.is_empty() {
        return;
    }
    let prefix = if dry_run { "[dry-run] " } else { "" };
    let changed = report.changed();
    if changed == 0 && report.failures.is_empty() {
        println!("{prefix}✓ {kind}: {} in sync", report.results.len());
        return;
    }
    println!(
        "{prefix}✓ {kind}: {changed} changed, {} in sync, {} failed",
        report.results.len() - changed,
        report.failures.len()
    );

    for result in report.results.iter().filter(|r| r.outcome.is_change()) {
        println!("  {}  {}", outcome_label(&result.outcome), result.key);
    }
    for (key, err) in &report.failures {
        println!("  ✗  {key}: {err}");
    }
}

fn outcome_label(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Created => "+ created".to_string(),
        SyncOutcome::Updated { from, to } => format!("✎ updated v{from} → v{to}"),
        SyncOutcome::Deleted => "- deleted".to_string(),
        SyncOutcome::StaleRemoved => "- stale mirror removed".to_string(),
        SyncOutcome::WouldApply(PlannedAction::Create) => "~ would create".to_string(),
        SyncOutcome::WouldApply(PlannedAction::Update { from, to }) => {
            format!("~ would update v{from} → v{to}")
        }
        SyncOutcome::WouldApply(PlannedAction::Delete) => "~ would delete".to_string(),
        SyncOutcome::InSync | SyncOutcome::AlreadyAbsent => "· unchanged".to_string(),
    }
}
