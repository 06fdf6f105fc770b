//! `fleet agent`: foreground agent runtime and control over TCP.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use fleet_agent::{request_status, request_stop, start_blocking, AgentError};

use super::load_config;

const DEFAULT_ADDR: &str = "127.0.0.1:7443";

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Run the agent in the foreground.
    Start(AgentArgs),
    /// Request graceful agent shutdown.
    Stop(AgentArgs),
    /// Query agent runtime status.
    Status(AgentArgs),
}

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Agent config file (default: ~/.fleet/agent.yaml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Agent address; defaults to `listen` from the config file.
    #[arg(long)]
    pub addr: Option<String>,
}

impl AgentArgs {
    /// Explicit address, else the config's listen address, else the default.
    fn addr(&self) -> String {
        if let Some(addr) = &self.addr {
            return addr.clone();
        }
        load_config(self.config.as_deref())
            .map(|config| config.listen)
            .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
    }
}

pub fn run(command: AgentCommand) -> Result<()> {
    match command {
        AgentCommand::Start(args) => {
            let mut config = load_config(args.config.as_deref())?;
            if let Some(addr) = args.addr {
                config.listen = addr;
            }
            start_blocking(config).context("agent exited with error")?;
        }
        AgentCommand::Stop(args) => {
            let addr = args.addr();
            match request_stop(&addr) {
                Ok(()) => println!("agent stop requested"),
                Err(AgentError::AgentNotRunning { .. }) => println!("agent is not running"),
                Err(err) => return Err(err).context("failed to stop agent"),
            }
        }
        AgentCommand::Status(args) => {
            let addr = args.addr();
            let status = match request_status(&addr) {
                Ok(status) => status,
                Err(AgentError::AgentNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "addr": addr,
                }),
                Err(err) => return Err(err).context("failed to query agent status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render agent status JSON")?
            );
        }
    }

    Ok(())
}
