//! Error types for fleet-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ObjectKey, ResourceKind};

/// All errors a declarative store can report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object with this identity exists.
    #[error("{kind} {key} not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },

    /// Create collided with an existing object.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ResourceKind, key: ObjectKey },

    /// Optimistic-concurrency check failed on update.
    #[error("conflict on {kind} {key}: expected version {expected:?}, stored version {actual}")]
    Conflict {
        kind: ResourceKind,
        key: ObjectKey,
        expected: Option<u64>,
        actual: u64,
    },

    /// The store's admission rule refused the operation.
    #[error("{kind} {key} rejected: {reason}")]
    Forbidden {
        kind: ResourceKind,
        key: ObjectKey,
        reason: String,
    },

    /// Object identity does not match the kind's scope.
    #[error("invalid {kind} {key}: {reason}")]
    Invalid {
        kind: ResourceKind,
        key: ObjectKey,
        reason: String,
    },

    /// Underlying I/O failure, with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored object could not be parsed.
    #[error("failed to parse object at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The persisted resource-version counter is unreadable. Issuing
    /// versions from a guess could move them backwards.
    #[error("corrupt version counter at {path}: {raw:?}")]
    CorruptCounter { path: PathBuf, raw: String },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The store lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// Errors raised while loading agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error on load: includes file path and line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config not found at {path}")]
    NotFound { path: PathBuf },

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("invalid config: {0}")]
    Invalid(String),
}
