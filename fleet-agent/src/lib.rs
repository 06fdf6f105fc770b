//! Agent runtime: cluster sessions and scouts on the pivot, watcher-driven
//! replication and orphan sweeps on members, and the TCP report server.

pub mod dispatch;
mod error;
pub mod protocol;
pub mod registry;
mod runtime;
pub mod scout;
pub mod signal;
pub mod watcher;

pub use dispatch::{Backoff, DispatchCounts, Dispatcher, WorkQueue};
pub use error::{AgentError, RegistryError};
pub use protocol::{
    request_status, request_stop, send_heartbeat, send_request, AgentRequest, AgentResponse,
};
pub use registry::{ClusterRegistry, ClusterSession, ClusterView};
pub use runtime::{init_tracing, run, start_blocking, SweepSummary, CLUSTER_POLL_INTERVAL};
pub use scout::{Scout, ScoutRole};
pub use signal::ShutdownSignal;
pub use watcher::PivotWatcher;
