//! Error types for fleet-sync.

use std::num::ParseIntError;

use thiserror::Error;

use fleet_core::{ObjectKey, ResourceKind, StoreError};

/// All errors that can arise from sync, sweep and health-write operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from either declarative store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The tracking annotation does not hold a decimal version. Precedence
    /// cannot be decided until it is corrected.
    #[error("malformed tracking annotation on {kind} {key}: {value:?}: {source}")]
    MalformedTracking {
        kind: ResourceKind,
        key: ObjectKey,
        value: String,
        #[source]
        source: ParseIntError,
    },

    /// An object body could not be rendered for diffing.
    #[error("YAML rendering error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Store(err) if err.is_not_found())
    }
}
