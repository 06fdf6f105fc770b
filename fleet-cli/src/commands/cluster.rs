//! `fleet cluster list`: registered clusters and their health.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use fleet_core::{store::SharedStore, ClusterConfig, ClusterHealth, FileStore, HealthState};
use fleet_sync::health;

use super::load_config;

#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// List registered clusters with their health.
    List(ClusterListArgs),
}

#[derive(Args, Debug)]
pub struct ClusterListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,

    /// Agent config file (default: ~/.fleet/agent.yaml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Pivot store directory; overrides the config file.
    #[arg(long)]
    pub pivot: Option<PathBuf>,
}

pub fn run(command: ClusterCommand) -> Result<()> {
    match command {
        ClusterCommand::List(args) => args.run(),
    }
}

#[derive(Serialize)]
struct ClusterJson {
    name: String,
    state: HealthState,
    reason: String,
    last_heartbeat: Option<DateTime<Utc>>,
    store: String,
}

#[derive(Tabled)]
struct ClusterRow {
    #[tabled(rename = "cluster")]
    name: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "reason")]
    reason: String,
    #[tabled(rename = "last heartbeat")]
    last_heartbeat: String,
    #[tabled(rename = "store")]
    store: String,
}

impl ClusterListArgs {
    pub fn run(self) -> Result<()> {
        let pivot_dir = match self.pivot {
            Some(dir) => dir,
            None => load_config(self.config.as_deref())?.pivot_store,
        };
        let pivot: SharedStore = Arc::new(
            FileStore::open(&pivot_dir)
                .with_context(|| format!("failed to open pivot store {}", pivot_dir.display()))?,
        );
        let clusters = health::list_clusters(&pivot).context("failed to list clusters")?;

        if self.json {
            let payload: Vec<ClusterJson> = clusters
                .into_iter()
                .map(|(config, health)| ClusterJson {
                    name: config.name.to_string(),
                    state: health.state,
                    reason: health.reason,
                    last_heartbeat: health.last_heartbeat,
                    store: config.store.display().to_string(),
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize clusters")?
            );
            return Ok(());
        }

        print_table(clusters);
        Ok(())
    }
}

fn print_table(clusters: Vec<(ClusterConfig, ClusterHealth)>) {
    if clusters.is_empty() {
        println!("No clusters registered.");
        return;
    }

    let abnormal = clusters
        .iter()
        .filter(|(_, health)| health.state == HealthState::Abnormal)
        .count();
    let rows: Vec<ClusterRow> = clusters
        .into_iter()
        .map(|(config, health)| ClusterRow {
            name: config.name.to_string(),
            state: state_label(health.state),
            reason: health.reason,
            last_heartbeat: health
                .last_heartbeat
                .map(format_age)
                .unwrap_or_else(|| "never".to_string()),
            store: config.store.display().to_string(),
        })
        .collect();
    let count = rows.len();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!("{count} clusters | {abnormal} abnormal");
}

fn state_label(state: HealthState) -> String {
    match state {
        HealthState::Normal => "● normal".green().to_string(),
        HealthState::Abnormal => "● abnormal".red().to_string(),
        HealthState::Processing => "● processing".yellow().to_string(),
    }
}

fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
