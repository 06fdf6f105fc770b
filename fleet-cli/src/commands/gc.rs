//! `fleet gc`: one orphan sweep.

use anyhow::{bail, Result};
use clap::Args;

use fleet_sync::Sweeper;

use super::StoreArgs;

/// Arguments for `fleet gc`.
#[derive(Args, Debug)]
pub struct GcArgs {
    /// Report orphans without deleting them.
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub stores: StoreArgs,
}

impl GcArgs {
    pub fn run(self) -> Result<()> {
        let stores = self.stores.open()?;
        let report = Sweeper::new(stores.pivot, stores.local)
            .with_dry_run(self.dry_run)
            .sweep();

        let prefix = if report.dry_run { "[dry-run] " } else { "" };
        let verb = if report.dry_run { "would delete" } else { "deleted" };
        println!(
            "{prefix}gc: {} checked, {} {verb}, {} kept",
            report.checked, report.deleted, report.kept
        );
        for reason in &report.skipped {
            println!("  ·  skipped {reason}");
        }
        for reason in &report.failed {
            println!("  ✗  {reason}");
        }

        if !report.failed.is_empty() {
            bail!("{} orphan(s) could not be removed", report.failed.len());
        }
        Ok(())
    }
}
