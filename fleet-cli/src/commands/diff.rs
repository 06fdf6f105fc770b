//! `fleet diff <kind> <name>`: show what sync would change for one object.

use anyhow::{Context, Result};
use clap::Args;

use fleet_core::{ObjectKey, ResourceKind};
use fleet_sync::diff::diff_object;

use super::StoreArgs;

/// Arguments for `fleet diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Object kind (e.g. `tenant`, `role-binding`).
    pub kind: ResourceKind,

    /// Object name.
    pub name: String,

    /// Namespace, for namespaced kinds.
    #[arg(long, short = 'n')]
    pub namespace: Option<String>,

    #[command(flatten)]
    pub stores: StoreArgs,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let key = match self.namespace {
            Some(namespace) => ObjectKey::namespaced(namespace, self.name),
            None => ObjectKey::cluster_scoped(self.name),
        };
        let stores = self.stores.open()?;
        let engine = stores.engine(true);

        let diff = diff_object(&engine, self.kind, &key)
            .with_context(|| format!("diff failed for {} {key}", self.kind))?;
        if diff.is_empty() {
            println!("No differences for {} {key}.", self.kind);
            return Ok(());
        }

        print!("{}", diff.unified_diff);
        if !diff.unified_diff.ends_with('\n') {
            println!();
        }
        Ok(())
    }
}
