//! `fleet heartbeat`: report liveness for a cluster once.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;

use fleet_agent::send_heartbeat;
use fleet_core::{ClusterName, Heartbeat};

use super::load_config;

/// Arguments for `fleet heartbeat`.
#[derive(Args, Debug)]
pub struct HeartbeatArgs {
    /// Cluster the heartbeat is reported for.
    #[arg(long)]
    pub cluster: String,

    /// Pivot agent address; defaults to `pivot_addr` from the config file.
    #[arg(long)]
    pub addr: Option<String>,

    /// Agent config file (default: ~/.fleet/agent.yaml).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl HeartbeatArgs {
    pub fn run(self) -> Result<()> {
        let addr = match self.addr {
            Some(addr) => addr,
            None => load_config(self.config.as_deref())?
                .pivot_addr
                .context("no --addr given and config has no pivot_addr")?,
        };
        let heartbeat = Heartbeat {
            cluster: ClusterName::from(self.cluster),
            timestamp: Utc::now(),
        };
        send_heartbeat(&addr, &heartbeat)
            .with_context(|| format!("heartbeat for '{}' failed", heartbeat.cluster))?;
        println!("heartbeat sent for '{}' to {addr}", heartbeat.cluster);
        Ok(())
    }
}
