//! Registry of live cluster sessions, keyed by cluster name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use fleet_core::{store::SharedStore, ClusterConfig, ClusterName};

use crate::error::{AgentError, RegistryError};
use crate::scout::Scout;
use crate::signal::ShutdownSignal;

/// Everything the control plane holds for one registered cluster.
///
/// The session exclusively owns its store client and its scout. The
/// cancellation signal is shared with every background task working on the
/// cluster; closing it is how a session is torn down.
pub struct ClusterSession {
    config: ClusterConfig,
    client: SharedStore,
    monitor: Scout,
    cancel: ShutdownSignal,
}

impl ClusterSession {
    pub fn builder(config: ClusterConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            client: None,
            monitor: None,
            cancel: None,
        }
    }

    pub fn name(&self) -> &ClusterName {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn client(&self) -> &SharedStore {
        &self.client
    }

    pub fn monitor(&self) -> &Scout {
        &self.monitor
    }

    pub fn cancel(&self) -> &ShutdownSignal {
        &self.cancel
    }

    /// Starts the session's scout under the session's signal.
    pub fn start(&self) -> Result<(), AgentError> {
        self.monitor.start(self.cancel.clone())
    }
}

pub struct SessionBuilder {
    config: ClusterConfig,
    client: Option<SharedStore>,
    monitor: Option<Scout>,
    cancel: Option<ShutdownSignal>,
}

impl SessionBuilder {
    pub fn client(mut self, client: SharedStore) -> Self {
        self.client = Some(client);
        self
    }

    pub fn monitor(mut self, monitor: Scout) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Signal to tear the session down with. A fresh one is created when
    /// none is given.
    pub fn cancel(mut self, cancel: ShutdownSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> Result<ClusterSession, RegistryError> {
        let cluster = self.config.name.clone();
        let client = self.client.ok_or_else(|| RegistryError::Incomplete {
            cluster: cluster.clone(),
            missing: "client",
        })?;
        let monitor = self.monitor.ok_or_else(|| RegistryError::Incomplete {
            cluster: cluster.clone(),
            missing: "monitor",
        })?;
        if monitor.cluster() != &cluster {
            return Err(RegistryError::NameMismatch {
                expected: cluster,
                actual: monitor.cluster().clone(),
            });
        }
        Ok(ClusterSession {
            config: self.config,
            client,
            monitor,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

/// Read-only view of a session, as returned by [`ClusterRegistry::snapshot`].
#[derive(Clone)]
pub struct ClusterView {
    pub config: ClusterConfig,
    pub client: SharedStore,
}

/// Name → session map behind a single lock.
#[derive(Default)]
pub struct ClusterRegistry {
    sessions: RwLock<HashMap<ClusterName, Arc<ClusterSession>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session` under `name`. An existing session with the same
    /// name is left untouched and the call fails.
    pub async fn add(
        &self,
        name: &ClusterName,
        session: ClusterSession,
    ) -> Result<Arc<ClusterSession>, RegistryError> {
        if session.name() != name {
            return Err(RegistryError::NameMismatch {
                expected: name.clone(),
                actual: session.name().clone(),
            });
        }
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(name) {
            return Err(RegistryError::Duplicate(name.clone()));
        }
        let session = Arc::new(session);
        sessions.insert(name.clone(), session.clone());
        tracing::info!(cluster = %name, "cluster session added");
        Ok(session)
    }

    pub async fn get(&self, name: &ClusterName) -> Result<Arc<ClusterSession>, RegistryError> {
        self.sessions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.clone()))
    }

    /// Closes the session's signal and removes it. Background tasks of the
    /// session observe the closed signal and stop.
    pub async fn delete(&self, name: &ClusterName) -> Result<Arc<ClusterSession>, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.clone()))?;
        session.cancel().close();
        sessions.remove(name);
        tracing::info!(cluster = %name, "cluster session deleted");
        Ok(session)
    }

    pub async fn snapshot(&self) -> BTreeMap<ClusterName, ClusterView> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(name, session)| {
                (
                    name.clone(),
                    ClusterView {
                        config: session.config().clone(),
                        client: session.client().clone(),
                    },
                )
            })
            .collect()
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<ClusterName> {
        let mut names: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every live session, sorted by name.
    pub async fn sessions(&self) -> Vec<Arc<ClusterSession>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.name().cmp(b.name()));
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use fleet_core::{config::ScoutSettings, MemoryStore, StoreOp};
    use fleet_sync::{health, RetryPolicy};

    use super::*;
    use crate::scout::ScoutRole;

    fn config(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: ClusterName::from(name),
            store: PathBuf::from(format!("/srv/{name}")),
        }
    }

    fn session(pivot: &SharedStore, name: &str) -> ClusterSession {
        ClusterSession::builder(config(name))
            .client(Arc::new(MemoryStore::new()))
            .monitor(Scout::new(
                ClusterName::from(name),
                ScoutRole::Member,
                pivot.clone(),
                ScoutSettings::default(),
            ))
            .build()
            .expect("session")
    }

    #[tokio::test]
    async fn builder_requires_client_and_monitor() {
        let pivot: SharedStore = Arc::new(MemoryStore::new());
        let err = ClusterSession::builder(config("m1"))
            .client(pivot.clone())
            .build()
            .err()
            .expect("incomplete");
        assert_eq!(
            err,
            RegistryError::Incomplete {
                cluster: ClusterName::from("m1"),
                missing: "monitor",
            }
        );

        let err = ClusterSession::builder(config("m1"))
            .monitor(Scout::new(
                "m1".into(),
                ScoutRole::Member,
                pivot,
                ScoutSettings::default(),
            ))
            .build()
            .err()
            .expect("incomplete");
        assert!(matches!(err, RegistryError::Incomplete { missing: "client", .. }));
    }

    #[tokio::test]
    async fn duplicate_add_keeps_existing_session() {
        let pivot: SharedStore = Arc::new(MemoryStore::new());
        let registry = ClusterRegistry::new();
        let name = ClusterName::from("m1");
        let first = registry.add(&name, session(&pivot, "m1")).await.expect("add");

        let err = registry
            .add(&name, session(&pivot, "m1"))
            .await
            .err()
            .expect("duplicate");
        assert_eq!(err, RegistryError::Duplicate(name.clone()));
        assert_eq!(registry.len().await, 1);
        let current = registry.get(&name).await.expect("get");
        assert!(Arc::ptr_eq(&first, &current));
    }

    #[tokio::test]
    async fn add_rejects_mismatched_name() {
        let pivot: SharedStore = Arc::new(MemoryStore::new());
        let registry = ClusterRegistry::new();
        let err = registry
            .add(&ClusterName::from("other"), session(&pivot, "m1"))
            .await
            .err()
            .expect("mismatch");
        assert!(matches!(err, RegistryError::NameMismatch { .. }));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let registry = ClusterRegistry::new();
        let err = registry
            .delete(&ClusterName::from("ghost"))
            .await
            .err()
            .expect("missing");
        assert_eq!(err, RegistryError::NotFound(ClusterName::from("ghost")));
    }

    #[tokio::test]
    async fn snapshot_and_names_are_sorted_copies() {
        let pivot: SharedStore = Arc::new(MemoryStore::new());
        let registry = ClusterRegistry::new();
        for name in ["m2", "m1"] {
            registry
                .add(&ClusterName::from(name), session(&pivot, name))
                .await
                .expect("add");
        }
        assert_eq!(
            registry.names().await,
            vec![ClusterName::from("m1"), ClusterName::from("m2")]
        );
        let snapshot = registry.snapshot().await;
        registry.delete(&ClusterName::from("m1")).await.expect("delete");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&ClusterName::from("m1")].config, config("m1"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_session_stops_writing_health() {
        let memory = Arc::new(MemoryStore::new());
        let pivot: SharedStore = memory.clone();
        health::register_cluster(&pivot, &config("m1"), &RetryPolicy::default())
            .expect("register");
        let registry = ClusterRegistry::new();
        let name = ClusterName::from("m1");
        let live = registry.add(&name, session(&pivot, "m1")).await.expect("add");
        live.start().expect("start");
        memory.clear_journal();

        let removed = registry.delete(&name).await.expect("delete");
        assert!(removed.cancel().is_closed());
        removed.monitor().join().await;

        let _ = removed
            .monitor()
            .report(fleet_core::Heartbeat {
                cluster: name.clone(),
                timestamp: chrono::Utc::now(),
            })
            .await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        let writes = memory
            .journal()
            .into_iter()
            .filter(|op| matches!(op, StoreOp::UpdateStatus(_)))
            .count();
        assert_eq!(writes, 0);
        assert!(registry.get(&name).await.is_err());
    }
}
