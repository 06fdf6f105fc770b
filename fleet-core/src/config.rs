//! Agent configuration.
//!
//! Loaded from YAML, by default at `~/.fleet/agent.yaml`:
//!
//! ```yaml
//! role: member
//! cluster_name: edge-1
//! pivot_store: /srv/fleet/pivot
//! local_store: /srv/fleet/edge-1
//! pivot_addr: 10.0.0.5:7443
//! scout:
//!   wait_timeout_secs: 10
//!   initial_delay_secs: 10
//! sync:
//!   workers: 4
//!   resync_secs: 60
//!   staleness_check: pivot-newer
//! gc:
//!   interval_secs: 300
//! ```
//!
//! As with every `_at` function in this workspace, tests call [`load_at`]
//! with an explicit path and never the home-relative wrapper.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::ClusterName;

/// Which side of the control plane this agent runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Pivot,
    Member,
}

/// How the sync engine decides that a local mirror is an out-of-band
/// namesake rather than a copy of the pivot object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StalenessCheck {
    /// Local mirror is stale when the pivot object was created strictly
    /// after it.
    #[default]
    PivotNewer,
    /// Never treat a mirror as stale; precedence is decided by tracking
    /// versions alone.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutSettings {
    pub wait_timeout_secs: u64,
    pub initial_delay_secs: u64,
}

impl Default for ScoutSettings {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 10,
            initial_delay_secs: 10,
        }
    }
}

impl ScoutSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub workers: usize,
    pub resync_secs: u64,
    pub staleness_check: StalenessCheck,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_secs: 60,
            staleness_check: StalenessCheck::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcSettings {
    pub interval_secs: u64,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub role: Role,
    /// This agent's own cluster. Required for members; the pivot defaults
    /// to `pivot`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<ClusterName>,
    pub pivot_store: PathBuf,
    /// Member-side store receiving the mirror.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_store: Option<PathBuf>,
    /// Address the pivot agent accepts reports on.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pivot agent address a member reports to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_addr: Option<String>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Enforce the tenancy delete-protection rule on the local store.
    #[serde(default = "default_true")]
    pub protect_tenancy: bool,
    #[serde(default)]
    pub scout: ScoutSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub gc: GcSettings,
}

fn default_listen() -> String {
    "127.0.0.1:7443".to_string()
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Minimal pivot configuration with every default applied.
    pub fn pivot(pivot_store: impl Into<PathBuf>) -> Self {
        Self {
            role: Role::Pivot,
            cluster_name: None,
            pivot_store: pivot_store.into(),
            local_store: None,
            listen: default_listen(),
            pivot_addr: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            protect_tenancy: true,
            scout: ScoutSettings::default(),
            sync: SyncSettings::default(),
            gc: GcSettings::default(),
        }
    }

    /// Minimal member configuration with every default applied.
    pub fn member(
        cluster_name: impl Into<ClusterName>,
        pivot_store: impl Into<PathBuf>,
        local_store: impl Into<PathBuf>,
        pivot_addr: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Member,
            cluster_name: Some(cluster_name.into()),
            local_store: Some(local_store.into()),
            pivot_addr: Some(pivot_addr.into()),
            ..Self::pivot(pivot_store)
        }
    }

    /// Name of the cluster this agent acts for.
    pub fn cluster(&self) -> ClusterName {
        self.cluster_name
            .clone()
            .unwrap_or_else(|| ClusterName::from("pivot"))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc.interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.resync_secs)
    }

    /// Checks cross-field requirements serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.role == Role::Member {
            if self.cluster_name.is_none() {
                return Err(ConfigError::Invalid(
                    "member agents require cluster_name".to_string(),
                ));
            }
            if self.local_store.is_none() {
                return Err(ConfigError::Invalid(
                    "member agents require local_store".to_string(),
                ));
            }
            if self.pivot_addr.is_none() {
                return Err(ConfigError::Invalid(
                    "member agents require pivot_addr".to_string(),
                ));
            }
        }
        let durations = [
            ("scout.wait_timeout_secs", self.scout.wait_timeout_secs),
            ("sync.resync_secs", self.sync.resync_secs),
            ("gc.interval_secs", self.gc.interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be non-zero")));
            }
        }
        if self.sync.workers == 0 {
            return Err(ConfigError::Invalid("sync.workers must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// `<home>/.fleet/agent.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".fleet").join("agent.yaml")
}

/// `config_path_at` convenience wrapper.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_path_at(&home()?))
}

/// Load and validate the configuration at `path`.
///
/// Returns `ConfigError::NotFound` if absent, `ConfigError::Parse` (with
/// path + line context) if malformed YAML.
pub fn load_at(path: &Path) -> Result<AgentConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    let config: AgentConfig = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper using `~/.fleet/agent.yaml`.
pub fn load() -> Result<AgentConfig, ConfigError> {
    load_at(&config_path()?)
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn minimal_member_yaml_gets_defaults() {
        let yaml = "role: member\ncluster_name: edge-1\npivot_store: /p\nlocal_store: /l\npivot_addr: 10.0.0.5:7443\n";
        let config: AgentConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.scout, ScoutSettings::default());
        assert_eq!(config.sync.workers, 4);
        assert_eq!(config.sync.staleness_check, StalenessCheck::PivotNewer);
        assert_eq!(config.gc.interval_secs, 300);
        assert!(config.protect_tenancy);
        config.validate().expect("valid");
    }

    #[test]
    fn staleness_check_parses_kebab_case() {
        let yaml = "role: pivot\npivot_store: /p\nsync:\n  staleness_check: disabled\n";
        let config: AgentConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.sync.staleness_check, StalenessCheck::Disabled);
        assert_eq!(config.sync.resync_secs, 60);
    }

    #[test]
    fn member_without_cluster_name_is_invalid() {
        let mut config = AgentConfig::member("m1", "/p", "/l", "127.0.0.1:7443");
        config.cluster_name = None;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_wait_timeout_is_invalid() {
        let mut config = AgentConfig::pivot("/p");
        config.scout.wait_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wait_timeout_secs"));
    }

    #[test]
    fn pivot_cluster_name_defaults() {
        assert_eq!(AgentConfig::pivot("/p").cluster(), ClusterName::from("pivot"));
    }

    #[test]
    fn load_missing_config_returns_not_found() {
        let home = TempDir::new().expect("home");
        let err = load_at(&config_path_at(home.path())).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn config_path_is_correct() {
        let home = TempDir::new().expect("home");
        assert!(config_path_at(home.path()).ends_with(".fleet/agent.yaml"));
    }
}
