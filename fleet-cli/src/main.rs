//! Fleet: multi-cluster control plane CLI.
//!
//! # Usage
//!
//! ```text
//! fleet agent start|stop|status [--config <file>] [--addr <host:port>]
//! fleet sync [--kind <kind>] [--dry-run] [--pivot <dir> --local <dir> | --config <file>]
//! fleet gc [--dry-run] [--pivot <dir> --local <dir> | --config <file>]
//! fleet diff <kind> <name> [--namespace <ns>] [--pivot <dir> --local <dir> | --config <file>]
//! fleet cluster list [--json] [--pivot <dir> | --config <file>]
//! fleet heartbeat --cluster <name> [--addr <host:port>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    agent::AgentCommand, cluster::ClusterCommand, diff::DiffArgs, gc::GcArgs,
    heartbeat::HeartbeatArgs, sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "fleet",
    version,
    about = "Replicate tenancy objects from a pivot cluster to its members",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or control the fleet agent.
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Reconcile local mirrors against the pivot store once.
    Sync(SyncArgs),

    /// Remove local mirrors whose pivot object is gone.
    Gc(GcArgs),

    /// Show the unified diff between a pivot object and its local mirror.
    Diff(DiffArgs),

    /// Inspect registered member clusters.
    Cluster {
        #[command(subcommand)]
        command: ClusterCommand,
    },

    /// Send a single heartbeat to the pivot agent.
    Heartbeat(HeartbeatArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent { command } => commands::agent::run(command),
        Commands::Sync(args) => args.run(),
        Commands::Gc(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Cluster { command } => commands::cluster::run(command),
        Commands::Heartbeat(args) => args.run(),
    }
}
