//! Cluster registration records and their health status.
//!
//! Health lives in the status of the cluster's `cluster` object in the
//! pivot store. Writes go through [`retry_on_conflict`]: each attempt
//! re-reads the record, applies the change and writes it back with the
//! version it just read.

use std::time::Duration;

use fleet_core::{
    store::SharedStore, ClusterConfig, ClusterHealth, ClusterName, LabelSelector, ObjectKey,
    Resource, ResourceKind, StoreError,
};

/// Bounded exponential backoff for conflicting writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub steps: u32,
    pub base: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 5,
            base: Duration::from_millis(10),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Sleep before attempt `attempt` (0-based; the first attempt never waits).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.base * self.factor.saturating_pow(attempt - 1)
    }
}

/// Runs `op` until it succeeds, fails with a non-conflict error, or the
/// policy's steps are used up. Blocks the calling thread between attempts.
pub fn retry_on_conflict<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut attempt = 0;
    loop {
        std::thread::sleep(policy.delay(attempt));
        match op() {
            Err(err) if err.is_conflict() && attempt + 1 < policy.steps => {
                tracing::debug!("write conflict (attempt {}): {err}", attempt + 1);
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn record_key(cluster: &ClusterName) -> ObjectKey {
    ObjectKey::cluster_scoped(cluster.as_str())
}

/// Current health of `cluster` as recorded in the pivot store.
pub fn read_health(pivot: &SharedStore, cluster: &ClusterName) -> Result<ClusterHealth, StoreError> {
    let record = pivot.get(ResourceKind::Cluster, &record_key(cluster))?;
    Ok(ClusterHealth::from_resource(&record))
}

/// Writes `health` into the registration record of `cluster`.
pub fn write_health(
    pivot: &SharedStore,
    cluster: &ClusterName,
    health: &ClusterHealth,
    policy: &RetryPolicy,
) -> Result<Resource, StoreError> {
    let key = record_key(cluster);
    retry_on_conflict(policy, || {
        let mut record = pivot.get(ResourceKind::Cluster, &key)?;
        record.status = health.to_status();
        pivot.update_status(&record)
    })
}

/// Creates the registration record for `config`, or refreshes its spec if
/// one already exists. Existing health status is preserved.
pub fn register_cluster(
    pivot: &SharedStore,
    config: &ClusterConfig,
    policy: &RetryPolicy,
) -> Result<Resource, StoreError> {
    let desired = config.to_record();
    match pivot.create(&desired) {
        Ok(created) => {
            tracing::info!("registered cluster {}", config.name);
            Ok(created)
        }
        Err(err) if err.is_already_exists() => retry_on_conflict(policy, || {
            let mut current = pivot.get(ResourceKind::Cluster, &desired.key())?;
            if current.spec == desired.spec {
                return Ok(current);
            }
            current.spec = desired.spec.clone();
            pivot.update(&current)
        }),
        Err(err) => Err(err),
    }
}

/// Every registered cluster, skipping records whose spec cannot be read.
pub fn list_clusters(pivot: &SharedStore) -> Result<Vec<(ClusterConfig, ClusterHealth)>, StoreError> {
    let records = pivot.list(ResourceKind::Cluster, &LabelSelector::everything())?;
    Ok(records
        .iter()
        .filter_map(|record| match ClusterConfig::from_record(record) {
            Ok(config) => Some((config, ClusterHealth::from_resource(record))),
            Err(err) => {
                tracing::warn!("skipping cluster record {}: {err}", record.metadata.name);
                None
            }
        })
        .collect())
}
