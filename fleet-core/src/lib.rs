//! Fleet core library: domain types, the declarative store contract and its
//! in-memory and on-disk implementations, agent configuration.
//!
//! - [`types`]: resources, identities, cluster health
//! - [`store`]: the [`ResourceStore`] trait and shared write semantics
//! - [`memory`] / [`file_store`]: store implementations
//! - [`selector`]: label selectors for `list`
//! - [`config`]: agent configuration loading
//! - [`error`]: [`StoreError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod file_store;
pub mod memory;
pub mod selector;
pub mod store;
pub mod types;

pub use config::{AgentConfig, Role, StalenessCheck};
pub use error::{ConfigError, StoreError};
pub use file_store::FileStore;
pub use memory::{MemoryStore, StoreOp};
pub use selector::LabelSelector;
pub use store::{DeletePolicy, ResourceStore, SharedStore};
pub use types::{
    keys, ClusterConfig, ClusterHealth, ClusterName, HealthState, Heartbeat, ObjectKey,
    ObjectMeta, Resource, ResourceKind,
};
