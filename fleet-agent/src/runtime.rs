use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};

use fleet_core::{
    store::SharedStore, AgentConfig, ClusterConfig, ClusterName, ConfigError, DeletePolicy,
    FileStore, Heartbeat, Role,
};
use fleet_sync::{health, RetryPolicy, SweepReport, Sweeper, SyncEngine, SyncOptions};

use crate::dispatch::{DispatchStats, Dispatcher};
use crate::error::{io_err, join_err, AgentError};
use crate::protocol::{AgentRequest, AgentResponse};
use crate::registry::{ClusterRegistry, ClusterSession};
use crate::scout::{Scout, ScoutRole};
use crate::signal::ShutdownSignal;
use crate::watcher::PivotWatcher;

/// How often the pivot re-reads cluster registrations.
pub const CLUSTER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Result of the most recent orphan sweep, as reported by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub at: DateTime<Utc>,
    pub checked: usize,
    pub deleted: usize,
    pub kept: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration_ms: u128,
}

impl SweepSummary {
    fn from_report(report: &SweepReport, duration: Duration) -> Self {
        Self {
            at: Utc::now(),
            checked: report.checked,
            deleted: report.deleted,
            kept: report.kept,
            skipped: report.skipped.len(),
            failed: report.failed.len(),
            duration_ms: duration.as_millis(),
        }
    }
}

/// State shared by every task of one agent process.
struct AgentState {
    config: AgentConfig,
    started_at: DateTime<Utc>,
    shutdown: ShutdownSignal,
    /// Pivot only.
    registry: Option<Arc<ClusterRegistry>>,
    /// Member only.
    dispatch: Option<Arc<DispatchStats>>,
    last_sweep: RwLock<Option<SweepSummary>>,
}

/// Start the agent runtime and block the current thread until it exits.
pub fn start_blocking(config: AgentConfig) -> Result<(), AgentError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the agent until a `stop` request or ctrl-c.
pub async fn run(config: AgentConfig) -> Result<(), AgentError> {
    config.validate()?;
    match config.role {
        Role::Pivot => run_pivot(config).await,
        Role::Member => run_member(config).await,
    }
}

// ---------------------------------------------------------------------------
// Pivot
// ---------------------------------------------------------------------------

async fn run_pivot(config: AgentConfig) -> Result<(), AgentError> {
    let pivot: SharedStore = Arc::new(FileStore::open(&config.pivot_store)?);
    let registry = Arc::new(ClusterRegistry::new());
    let own = config.cluster();

    let own_config = ClusterConfig {
        name: own.clone(),
        store: config.pivot_store.clone(),
    };
    {
        let pivot = pivot.clone();
        let own_config = own_config.clone();
        tokio::task::spawn_blocking(move || {
            health::register_cluster(&pivot, &own_config, &RetryPolicy::default())
        })
        .await
        .map_err(|err| join_err("register", err))??;
    }
    let session = ClusterSession::builder(own_config)
        .client(pivot.clone())
        .monitor(Scout::new(
            own.clone(),
            ScoutRole::Pivot,
            pivot.clone(),
            config.scout.clone(),
        ))
        .build()?;
    let own_session = registry.add(&own, session).await?;
    own_session.start()?;

    let listener = bind(&config.listen).await?;
    let state = Arc::new(AgentState {
        config,
        started_at: Utc::now(),
        shutdown: ShutdownSignal::new(),
        registry: Some(registry.clone()),
        dispatch: None,
        last_sweep: RwLock::new(None),
    });
    tracing::info!(cluster = %own, listen = %state.config.listen, "pivot agent started");

    let controller_handle = {
        let state = state.clone();
        let pivot = pivot.clone();
        tokio::spawn(async move {
            let result = cluster_controller_task(pivot, state.clone()).await;
            state.shutdown.close();
            result
        })
    };

    let reporter_handle = {
        let state = state.clone();
        let own_session = own_session.clone();
        tokio::spawn(async move {
            let result = self_report_task(own_session, state.clone()).await;
            state.shutdown.close();
            result
        })
    };

    let server_handle = spawn_server(listener, state.clone());
    let signal_handle = spawn_signal_handler(state.shutdown.clone());

    let (controller_result, reporter_result, server_result, signal_result) = tokio::join!(
        controller_handle,
        reporter_handle,
        server_handle,
        signal_handle
    );

    for name in registry.names().await {
        if let Ok(session) = registry.delete(&name).await {
            session.monitor().join().await;
        }
    }

    handle_join("cluster_controller", controller_result)?;
    handle_join("self_report", reporter_result)?;
    handle_join("server", server_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("pivot agent stopped");
    Ok(())
}

/// Keeps the registry in line with the cluster records in the pivot store.
async fn cluster_controller_task(
    pivot: SharedStore,
    state: Arc<AgentState>,
) -> Result<(), AgentError> {
    let mut interval = tokio::time::interval(CLUSTER_POLL_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.closed() => break,
            _ = interval.tick() => {
                if let Err(err) = reconcile_clusters(&pivot, &state).await {
                    tracing::warn!(error = %err, "cluster registration sync failed");
                }
            }
        }
    }
    Ok(())
}

async fn reconcile_clusters(pivot: &SharedStore, state: &AgentState) -> Result<(), AgentError> {
    let Some(registry) = state.registry.as_ref() else {
        return Ok(());
    };
    let own = state.config.cluster();

    let records = {
        let pivot = pivot.clone();
        tokio::task::spawn_blocking(move || health::list_clusters(&pivot))
            .await
            .map_err(|err| join_err("cluster list", err))??
    };
    let wanted: HashMap<ClusterName, ClusterConfig> = records
        .into_iter()
        .map(|(config, _)| (config.name.clone(), config))
        .filter(|(name, _)| name != &own)
        .collect();
    let current = registry.snapshot().await;

    for (name, view) in &current {
        if name == &own {
            continue;
        }
        let keep = wanted.get(name).is_some_and(|config| config == &view.config);
        if !keep {
            if let Ok(session) = registry.delete(name).await {
                session.monitor().join().await;
            }
        }
    }

    for (name, config) in wanted {
        if registry.get(&name).await.is_ok() {
            continue;
        }
        if let Err(err) = add_member_session(pivot, state, registry, config).await {
            tracing::warn!(cluster = %name, error = %err, "cannot add cluster session");
        }
    }
    Ok(())
}

async fn add_member_session(
    pivot: &SharedStore,
    state: &AgentState,
    registry: &ClusterRegistry,
    config: ClusterConfig,
) -> Result<(), AgentError> {
    let name = config.name.clone();
    let client: SharedStore = Arc::new(FileStore::open(&config.store)?);
    let session = ClusterSession::builder(config)
        .client(client)
        .monitor(Scout::new(
            name.clone(),
            ScoutRole::Member,
            pivot.clone(),
            state.config.scout.clone(),
        ))
        .build()?;
    let session = registry.add(&name, session).await?;
    session.start()?;
    Ok(())
}

/// The pivot reports its own liveness to its own scout, in-process.
async fn self_report_task(
    session: Arc<ClusterSession>,
    state: Arc<AgentState>,
) -> Result<(), AgentError> {
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.closed() => break,
            _ = ticker.tick() => {
                let heartbeat = Heartbeat {
                    cluster: session.name().clone(),
                    timestamp: Utc::now(),
                };
                if let Err(err) = session.monitor().report(heartbeat).await {
                    tracing::warn!(error = %err, "self heartbeat not delivered");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

async fn run_member(config: AgentConfig) -> Result<(), AgentError> {
    let local_path = config
        .local_store
        .clone()
        .ok_or_else(|| ConfigError::Invalid("member agents require local_store".to_string()))?;
    let pivot_addr = config
        .pivot_addr
        .clone()
        .ok_or_else(|| ConfigError::Invalid("member agents require pivot_addr".to_string()))?;

    let policy = if config.protect_tenancy {
        DeletePolicy::ProtectTenancy
    } else {
        DeletePolicy::Allow
    };
    let pivot: SharedStore = Arc::new(FileStore::open(&config.pivot_store)?);
    let local: SharedStore = Arc::new(FileStore::open_with_policy(local_path, policy)?);
    let engine = SyncEngine::new(pivot.clone(), local.clone()).with_options(SyncOptions {
        staleness: config.sync.staleness_check,
        dry_run: false,
    });
    let dispatcher = Dispatcher::new(engine.clone(), config.sync.workers);
    let watcher = PivotWatcher::new(
        config.pivot_store.clone(),
        engine,
        dispatcher.queue(),
        config.resync_interval(),
    );

    let listener = bind(&config.listen).await?;
    let state = Arc::new(AgentState {
        config,
        started_at: Utc::now(),
        shutdown: ShutdownSignal::new(),
        registry: None,
        dispatch: Some(dispatcher.stats()),
        last_sweep: RwLock::new(None),
    });
    tracing::info!(
        cluster = %state.config.cluster(),
        pivot = %pivot_addr,
        listen = %state.config.listen,
        "member agent started",
    );

    let dispatcher_handle = {
        let state = state.clone();
        tokio::spawn(async move {
            let result = dispatcher.run(state.shutdown.clone()).await;
            state.shutdown.close();
            result
        })
    };

    let watcher_handle = {
        let state = state.clone();
        tokio::spawn(async move {
            let result = watcher.run(state.shutdown.clone()).await;
            state.shutdown.close();
            result
        })
    };

    let gc_handle = {
        let state = state.clone();
        tokio::spawn(async move {
            let result = gc_task(pivot, local, state.clone()).await;
            state.shutdown.close();
            result
        })
    };

    let reporter_handle = {
        let state = state.clone();
        tokio::spawn(async move {
            let result = heartbeat_reporter_task(pivot_addr, state.clone()).await;
            state.shutdown.close();
            result
        })
    };

    let server_handle = spawn_server(listener, state.clone());
    let signal_handle = spawn_signal_handler(state.shutdown.clone());

    let (dispatcher_result, watcher_result, gc_result, reporter_result, server_result, signal_result) = tokio::join!(
        dispatcher_handle,
        watcher_handle,
        gc_handle,
        reporter_handle,
        server_handle,
        signal_handle
    );

    handle_join("dispatcher", dispatcher_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("gc", gc_result)?;
    handle_join("heartbeat_reporter", reporter_result)?;
    handle_join("server", server_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("member agent stopped");
    Ok(())
}

async fn gc_task(
    pivot: SharedStore,
    local: SharedStore,
    state: Arc<AgentState>,
) -> Result<(), AgentError> {
    let period = state.config.gc_interval();
    // First sweep one full period after start.
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.closed() => break,
            _ = interval.tick() => {
                let started = Instant::now();
                let sweeper = Sweeper::new(pivot.clone(), local.clone());
                match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                    Ok(report) => {
                        let summary = SweepSummary::from_report(&report, started.elapsed());
                        tracing::info!(
                            checked = summary.checked,
                            deleted = summary.deleted,
                            skipped = summary.skipped,
                            failed = summary.failed,
                            duration_ms = summary.duration_ms as u64,
                            "orphan sweep finished",
                        );
                        *state.last_sweep.write().await = Some(summary);
                    }
                    // Never crash the agent over one sweep.
                    Err(err) => tracing::error!(error = %err, "orphan sweep task failed"),
                }
            }
        }
    }
    Ok(())
}

async fn heartbeat_reporter_task(addr: String, state: Arc<AgentState>) -> Result<(), AgentError> {
    let cluster = state.config.cluster();
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.closed() => break,
            _ = ticker.tick() => {
                let heartbeat = Heartbeat {
                    cluster: cluster.clone(),
                    timestamp: Utc::now(),
                };
                let addr = addr.clone();
                let sent = tokio::task::spawn_blocking(move || {
                    crate::protocol::send_heartbeat(&addr, &heartbeat)
                })
                .await;
                match sent {
                    Ok(Ok(())) => tracing::debug!(cluster = %cluster, "heartbeat sent"),
                    Ok(Err(err)) => tracing::warn!(cluster = %cluster, error = %err, "heartbeat failed; retrying next tick"),
                    Err(err) => tracing::error!(error = %err, "heartbeat task failed"),
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Report / control server
// ---------------------------------------------------------------------------

async fn bind(addr: &str) -> Result<TcpListener, AgentError> {
    TcpListener::bind(addr).await.map_err(|e| io_err(addr, e))
}

fn spawn_server(
    listener: TcpListener,
    state: Arc<AgentState>,
) -> tokio::task::JoinHandle<Result<(), AgentError>> {
    tokio::spawn(async move {
        let result = server_task(listener, state.clone()).await;
        state.shutdown.close();
        result
    })
}

fn spawn_signal_handler(shutdown: ShutdownSignal) -> tokio::task::JoinHandle<Result<(), AgentError>> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.closed() => Ok(()),
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        tracing::info!("received ctrl-c, shutting down agent");
                        shutdown.close();
                        Ok(())
                    }
                    Err(err) => Err(AgentError::Protocol(format!("ctrl-c handler failed: {err}"))),
                }
            }
        }
    })
}

async fn server_task(listener: TcpListener, state: Arc<AgentState>) -> Result<(), AgentError> {
    loop {
        tokio::select! {
            biased;
            _ = state.shutdown.closed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(|e| io_err(&state.config.listen, e))?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, state).await {
                        tracing::error!(peer = %peer, error = %err, "client error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_client(stream: TcpStream, state: Arc<AgentState>) -> Result<(), AgentError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("agent socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<AgentRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &AgentResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request == AgentRequest::Stop;
        let response = match request {
            AgentRequest::Heartbeat { cluster, timestamp } => {
                route_heartbeat(&state, Heartbeat { cluster, timestamp }).await
            }
            AgentRequest::Status => AgentResponse::ok(build_status_payload(&state).await),
            AgentRequest::Stop => {
                state.shutdown.close();
                AgentResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn route_heartbeat(state: &AgentState, heartbeat: Heartbeat) -> AgentResponse {
    let Some(registry) = state.registry.as_ref() else {
        return AgentResponse::error("heartbeats are only accepted by the pivot agent");
    };
    let session = match registry.get(&heartbeat.cluster).await {
        Ok(session) => session,
        Err(err) => return AgentResponse::error(err.to_string()),
    };
    let cluster = heartbeat.cluster.clone();
    match session.monitor().report(heartbeat).await {
        Ok(()) => AgentResponse::ok(json!({ "cluster": cluster })),
        Err(err) => AgentResponse::error(err.to_string()),
    }
}

async fn build_status_payload(state: &AgentState) -> Value {
    let clusters: Vec<Value> = match state.registry.as_ref() {
        Some(registry) => registry
            .sessions()
            .await
            .iter()
            .map(|session| {
                json!({
                    "name": session.name(),
                    "state": session.monitor().state(),
                    "role": session.monitor().role().to_string(),
                    "store": session.config().store.display().to_string(),
                })
            })
            .collect(),
        None => Vec::new(),
    };
    let last_sweep = state.last_sweep.read().await.clone();
    let dispatch = state.dispatch.as_ref().map(|stats| stats.counts());

    json!({
        "running": true,
        "role": state.config.role,
        "cluster": state.config.cluster(),
        "listen": state.config.listen,
        "started_at": state.started_at,
        "clusters": clusters,
        "dispatch": dispatch,
        "last_sweep": last_sweep,
    })
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &AgentResponse,
) -> Result<(), AgentError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("agent socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("agent socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("agent socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), AgentError>, tokio::task::JoinError>,
) -> Result<(), AgentError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(join_err(task, err)),
    }
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`),
/// JSON lines when `FLEET_LOG_FORMAT=json`. Records from the `log` facade
/// are forwarded too.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FLEET_LOG_FORMAT").is_ok_and(|format| format == "json");
    let _ = if json {
        fmt().json().with_env_filter(filter).with_target(false).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}
