pub mod agent;
pub mod cluster;
pub mod diff;
pub mod gc;
pub mod heartbeat;
pub mod sync;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use fleet_core::{config, store::SharedStore, AgentConfig, DeletePolicy, FileStore};
use fleet_sync::{SyncEngine, SyncOptions};

/// Where the pivot and local stores live: explicit directories, or the
/// agent config file.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Agent config file (default: ~/.fleet/agent.yaml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Pivot store directory; overrides the config file.
    #[arg(long, requires = "local")]
    pub pivot: Option<PathBuf>,

    /// Local (member) store directory; overrides the config file.
    #[arg(long, requires = "pivot")]
    pub local: Option<PathBuf>,
}

/// Resolved store pair.
pub struct Stores {
    pub pivot: SharedStore,
    pub local: SharedStore,
    pub options: SyncOptions,
}

impl StoreArgs {
    pub fn open(&self) -> Result<Stores> {
        let (pivot_dir, local_dir, policy, options) = match (&self.pivot, &self.local) {
            (Some(pivot), Some(local)) => (
                pivot.clone(),
                local.clone(),
                DeletePolicy::ProtectTenancy,
                SyncOptions::default(),
            ),
            _ => {
                let config = load_config(self.config.as_deref())?;
                let local = config
                    .local_store
                    .clone()
                    .context("config has no local_store; pass --pivot and --local")?;
                let policy = if config.protect_tenancy {
                    DeletePolicy::ProtectTenancy
                } else {
                    DeletePolicy::Allow
                };
                let options = SyncOptions {
                    staleness: config.sync.staleness_check,
                    dry_run: false,
                };
                (config.pivot_store, local, policy, options)
            }
        };

        let pivot = FileStore::open(&pivot_dir)
            .with_context(|| format!("failed to open pivot store {}", pivot_dir.display()))?;
        let local = FileStore::open_with_policy(&local_dir, policy)
            .with_context(|| format!("failed to open local store {}", local_dir.display()))?;
        Ok(Stores {
            pivot: Arc::new(pivot),
            local: Arc::new(local),
            options,
        })
    }
}

impl Stores {
    pub fn engine(&self, dry_run: bool) -> SyncEngine {
        SyncEngine::new(self.pivot.clone(), self.local.clone()).with_options(SyncOptions {
            dry_run,
            ..self.options
        })
    }
}

/// Load the agent config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let config = match path {
        Some(path) => config::load_at(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => config::load().context("failed to load ~/.fleet/agent.yaml")?,
    };
    Ok(config)
}
