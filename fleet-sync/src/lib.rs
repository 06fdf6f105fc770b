//! # fleet-sync
//!
//! Pivot → member replication and the pieces built on it.
//!
//! - [`engine`]: per-identity reconcile ([`SyncEngine::reconcile`])
//! - [`gc`]: orphan sweep ([`Sweeper`])
//! - [`pipeline`]: one-shot reconcile of a whole scope
//! - [`health`]: cluster registration records and health writes
//! - [`diff`]: pivot vs mirror unified diffs

pub mod diff;
pub mod engine;
pub mod error;
pub mod gc;
pub mod health;
pub mod pipeline;
pub mod scope;

pub use engine::{delete_mirror, ObjectResult, PlannedAction, SyncEngine, SyncOptions, SyncOutcome};
pub use error::SyncError;
pub use gc::{SweepReport, Sweeper};
pub use health::RetryPolicy;
pub use pipeline::{KindReport, SyncScope};
pub use scope::in_scope;
