//! Per-cluster health monitor.
//!
//! A scout owns one serial loop fed by three inputs: heartbeats from the
//! cluster's agent, a ticker, and the session's cancellation signal.
//!
//! - heartbeat: the cluster is `Normal`. Heartbeats already queued behind
//!   the first are drained, and a write identical to the last successful one
//!   is skipped, so a burst of reports costs one store write.
//! - tick (first just past `initial_delay + wait_timeout`, then every
//!   `wait_timeout`): if the recorded last heartbeat is older than the wait
//!   window the cluster is marked `Abnormal`, once.
//! - cancellation wins over both and is re-checked before every write.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use fleet_core::{
    config::ScoutSettings, store::SharedStore, ClusterHealth, ClusterName, HealthState, Heartbeat,
};
use fleet_sync::{health, RetryPolicy};

use crate::error::AgentError;
use crate::signal::ShutdownSignal;

const HEARTBEAT_QUEUE: usize = 64;

/// Which side of the control plane the monitored cluster sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoutRole {
    /// A member cluster reporting over the network.
    Member,
    /// The pivot monitoring itself.
    Pivot,
}

impl std::fmt::Display for ScoutRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoutRole::Member => f.write_str("member"),
            ScoutRole::Pivot => f.write_str("pivot"),
        }
    }
}

/// Wall clock anchored at construction and advanced by the monotonic
/// (tokio) clock, so paused-time tests see time move.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

/// Health monitor handle for one cluster.
pub struct Scout {
    cluster: ClusterName,
    role: ScoutRole,
    heartbeat_tx: mpsc::Sender<Heartbeat>,
    state_rx: watch::Receiver<HealthState>,
    pending: Mutex<Option<ScoutLoop>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scout {
    /// Builds a scout writing health to `store`, the pivot store holding the
    /// cluster's registration record. Nothing runs until [`Scout::start`].
    pub fn new(
        cluster: ClusterName,
        role: ScoutRole,
        store: SharedStore,
        settings: ScoutSettings,
    ) -> Self {
        let (heartbeat_tx, heartbeats) = mpsc::channel(HEARTBEAT_QUEUE);
        let (state_tx, state_rx) = watch::channel(HealthState::Processing);
        let scout_loop = ScoutLoop {
            cluster: cluster.clone(),
            role,
            store,
            settings,
            retry: RetryPolicy::default(),
            clock: Clock::start(),
            heartbeats,
            state_tx,
            state: HealthState::Processing,
            last_heartbeat: None,
            last_written: None,
        };
        Self {
            cluster,
            role,
            heartbeat_tx,
            state_rx,
            pending: Mutex::new(Some(scout_loop)),
            task: Mutex::new(None),
        }
    }

    pub fn cluster(&self) -> &ClusterName {
        &self.cluster
    }

    pub fn role(&self) -> ScoutRole {
        self.role
    }

    /// Spawns the monitor loop. A scout runs at most once; a second call
    /// returns [`AgentError::AlreadyStarted`].
    pub fn start(&self, cancel: ShutdownSignal) -> Result<(), AgentError> {
        let scout_loop = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| AgentError::AlreadyStarted {
                cluster: self.cluster.clone(),
            })?;
        let handle = tokio::spawn(scout_loop.run(cancel));
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    /// Hands a heartbeat to the monitor loop.
    pub async fn report(&self, heartbeat: Heartbeat) -> Result<(), AgentError> {
        self.heartbeat_tx
            .send(heartbeat)
            .await
            .map_err(|_| AgentError::ChannelClosed("scout heartbeat queue"))
    }

    /// Current in-memory health state.
    pub fn state(&self) -> HealthState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state_rx.clone()
    }

    /// Waits for the loop to exit. Returns immediately if it never started
    /// or was already joined.
    pub async fn join(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(cluster = %self.cluster, error = %err, "scout task failed");
            }
        }
    }
}

struct ScoutLoop {
    cluster: ClusterName,
    role: ScoutRole,
    store: SharedStore,
    settings: ScoutSettings,
    retry: RetryPolicy,
    clock: Clock,
    heartbeats: mpsc::Receiver<Heartbeat>,
    state_tx: watch::Sender<HealthState>,
    state: HealthState,
    last_heartbeat: Option<DateTime<Utc>>,
    last_written: Option<ClusterHealth>,
}

impl ScoutLoop {
    async fn run(mut self, cancel: ShutdownSignal) {
        let period = self.settings.wait_timeout();
        // Abnormal needs strictly more than delay + window of silence.
        let first =
            Instant::now() + self.settings.initial_delay() + period + Duration::from_millis(1);
        let mut ticker = tokio::time::interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(cluster = %self.cluster, role = %self.role, "scout started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.closed() => break,
                heartbeat = self.heartbeats.recv() => {
                    let Some(heartbeat) = heartbeat else { break };
                    self.on_heartbeat(heartbeat, &cancel).await;
                }
                _ = ticker.tick() => self.on_tick(&cancel).await,
            }
        }
        tracing::info!(cluster = %self.cluster, role = %self.role, "scout stopped");
    }

    async fn on_heartbeat(&mut self, heartbeat: Heartbeat, cancel: &ShutdownSignal) {
        let mut coalesced = 0usize;
        while self.heartbeats.try_recv().is_ok() {
            coalesced += 1;
        }
        tracing::debug!(
            cluster = %self.cluster,
            reported_at = %heartbeat.timestamp,
            coalesced,
            "heartbeat received",
        );

        // Whole seconds: reports within one second yield an identical record.
        let received = self.clock.now().trunc_subsecs(0);
        self.last_heartbeat = Some(received);
        if self.state != HealthState::Normal {
            tracing::info!(
                cluster = %self.cluster,
                role = %self.role,
                from = %self.state,
                "cluster is healthy again",
            );
        }

        let record = ClusterHealth {
            state: HealthState::Normal,
            reason: "received heartbeat".to_string(),
            last_heartbeat: Some(received),
        };
        self.write(record, cancel).await;
        self.set_state(HealthState::Normal);
    }

    async fn on_tick(&mut self, cancel: &ShutdownSignal) {
        let stored = self.read_last_heartbeat().await;
        let last_heartbeat = stored.or(self.last_heartbeat);
        let window = chrono::Duration::from_std(self.settings.wait_timeout())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = self.clock.now();

        if let Some(at) = last_heartbeat {
            if now - at < window {
                self.set_state(HealthState::Normal);
                return;
            }
        }
        if self.state == HealthState::Abnormal {
            return;
        }

        tracing::warn!(
            cluster = %self.cluster,
            role = %self.role,
            last_heartbeat = ?last_heartbeat,
            "no heartbeat within wait window; marking cluster abnormal",
        );
        let record = ClusterHealth {
            state: HealthState::Abnormal,
            reason: "disconnected".to_string(),
            last_heartbeat,
        };
        if self.write(record, cancel).await {
            self.set_state(HealthState::Abnormal);
        }
    }

    async fn read_last_heartbeat(&self) -> Option<DateTime<Utc>> {
        let store = self.store.clone();
        let cluster = self.cluster.clone();
        match tokio::task::spawn_blocking(move || health::read_health(&store, &cluster)).await {
            Ok(Ok(record)) => record.last_heartbeat,
            Ok(Err(err)) => {
                tracing::warn!(cluster = %self.cluster, error = %err, "reading cluster health failed");
                None
            }
            Err(err) => {
                tracing::error!(cluster = %self.cluster, error = %err, "health read task failed");
                None
            }
        }
    }

    /// Persists `record`. Returns `true` when the store holds it afterwards.
    async fn write(&mut self, record: ClusterHealth, cancel: &ShutdownSignal) -> bool {
        if self.last_written.as_ref() == Some(&record) {
            tracing::debug!(cluster = %self.cluster, "health unchanged; skipping write");
            return true;
        }
        if cancel.is_closed() {
            return false;
        }

        let store = self.store.clone();
        let cluster = self.cluster.clone();
        let retry = self.retry;
        let body = record.clone();
        let result = tokio::task::spawn_blocking(move || {
            health::write_health(&store, &cluster, &body, &retry)
        })
        .await;

        match result {
            Ok(Ok(_)) => {
                tracing::debug!(cluster = %self.cluster, state = %record.state, "health written");
                self.last_written = Some(record);
                true
            }
            Ok(Err(err)) => {
                tracing::warn!(cluster = %self.cluster, error = %err, "writing cluster health failed");
                false
            }
            Err(err) => {
                tracing::error!(cluster = %self.cluster, error = %err, "health write task failed");
                false
            }
        }
    }

    fn set_state(&mut self, state: HealthState) {
        self.state = state;
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}
