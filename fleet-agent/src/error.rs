use std::path::PathBuf;

use thiserror::Error;

use fleet_core::ClusterName;

/// Error surface for the agent runtime, scouts and the report protocol.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("store error: {0}")]
    Store(#[from] fleet_core::StoreError),

    #[error("config error: {0}")]
    Config(#[from] fleet_core::ConfigError),

    #[error("sync error: {0}")]
    Sync(#[from] fleet_sync::SyncError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("scout for cluster '{cluster}' already started")]
    AlreadyStarted { cluster: ClusterName },

    #[error("{task} task failed: {message}")]
    Task { task: &'static str, message: String },

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("agent is not running (nothing listening on {addr})")]
    AgentNotRunning { addr: String },
}

/// Errors from [`ClusterRegistry`](crate::registry::ClusterRegistry) and
/// session construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("cluster '{0}' is already registered")]
    Duplicate(ClusterName),

    #[error("cluster '{0}' not found")]
    NotFound(ClusterName),

    #[error("session registered as '{expected}' is for cluster '{actual}'")]
    NameMismatch {
        expected: ClusterName,
        actual: ClusterName,
    },

    /// Builder finished without a required part.
    #[error("incomplete session for cluster '{cluster}': missing {missing}")]
    Incomplete {
        cluster: ClusterName,
        missing: &'static str,
    },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> AgentError {
    AgentError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn join_err(task: &'static str, err: tokio::task::JoinError) -> AgentError {
    AgentError::Task {
        task,
        message: err.to_string(),
    }
}
