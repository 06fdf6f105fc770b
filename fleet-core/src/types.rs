//! Domain types for the fleet control plane.
//!
//! Every object kept in a declarative store is a [`Resource`]: a kind, an
//! [`ObjectMeta`] header and two opaque JSON bodies (`spec`, `status`).
//! Identity is `(kind, namespace, name)`; the store-assigned fields
//! (`uid`, `resource_version`, `creation_timestamp`) never travel between
//! stores.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Well-known metadata keys
// ---------------------------------------------------------------------------

/// Annotation and label keys shared by the sync engine, the sweeper and the
/// store admission rule.
pub mod keys {
    /// Opt-in annotation marking an object as replicable to member clusters.
    pub const SYNC: &str = "fleet.io/sync";
    /// Label carried by objects propagated through namespace inheritance.
    pub const INHERITED_FROM: &str = "fleet.io/inherited-from";
    /// Tracking annotation: pivot resource version at replication time.
    pub const SYNC_VERSION: &str = "fleet.io/sync-version";
    /// Client-side apply bookkeeping; never replicated.
    pub const LAST_APPLIED: &str = "fleet.io/last-applied-configuration";
    /// Escape hatch that lets a delete-protected object be removed.
    pub const FORCE_DELETE: &str = "fleet.io/force-delete";
}

/// Parses a boolean flag the way annotation values are conventionally
/// written. Returns `None` for anything that is not a recognised literal.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterName(pub String);

impl ClusterName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ClusterName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClusterName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Resource kinds
// ---------------------------------------------------------------------------

/// Every kind the stores know about.
///
/// All kinds except [`ResourceKind::Cluster`] are replicated from the pivot
/// to member clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    Namespace,
    SubnamespaceAnchor,
    HotPlug,
    Tenant,
    Project,
    User,
    ResourceQuota,
    Cluster,
}

const REPLICATED: &[ResourceKind] = &[
    ResourceKind::Role,
    ResourceKind::RoleBinding,
    ResourceKind::ClusterRole,
    ResourceKind::ClusterRoleBinding,
    ResourceKind::Namespace,
    ResourceKind::SubnamespaceAnchor,
    ResourceKind::HotPlug,
    ResourceKind::Tenant,
    ResourceKind::Project,
    ResourceKind::User,
    ResourceKind::ResourceQuota,
];

impl ResourceKind {
    /// The fixed, ordered list of kinds mirrored from pivot to member.
    pub fn replicated() -> &'static [ResourceKind] {
        REPLICATED
    }

    pub fn is_replicated(self) -> bool {
        self != ResourceKind::Cluster
    }

    pub fn is_namespaced(self) -> bool {
        matches!(
            self,
            ResourceKind::Role
                | ResourceKind::RoleBinding
                | ResourceKind::SubnamespaceAnchor
                | ResourceKind::ResourceQuota
        )
    }

    /// Kinds the member store refuses to delete unless the object carries
    /// the force-delete annotation.
    pub fn is_delete_protected(self) -> bool {
        matches!(self, ResourceKind::Tenant | ResourceKind::Project)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Role => "role",
            ResourceKind::RoleBinding => "role-binding",
            ResourceKind::ClusterRole => "cluster-role",
            ResourceKind::ClusterRoleBinding => "cluster-role-binding",
            ResourceKind::Namespace => "namespace",
            ResourceKind::SubnamespaceAnchor => "subnamespace-anchor",
            ResourceKind::HotPlug => "hot-plug",
            ResourceKind::Tenant => "tenant",
            ResourceKind::Project => "project",
            ResourceKind::User => "user",
            ResourceKind::ResourceQuota => "resource-quota",
            ResourceKind::Cluster => "cluster",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase().replace('_', "-");
        REPLICATED
            .iter()
            .copied()
            .chain(std::iter::once(ResourceKind::Cluster))
            .find(|kind| kind.as_str() == wanted || kind.as_str().replace('-', "") == wanted)
            .ok_or_else(|| format!("unknown resource kind '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// `(namespace, name)` identity of an object within one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::namespaced(ns, name))
            }
            None if !s.is_empty() => Ok(Self::cluster_scoped(s)),
            _ => Err(format!("invalid object key '{s}'; expected <name> or <namespace>/<name>")),
        }
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// Object header. The three `Option` bookkeeping fields are assigned by the
/// store that holds the object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A stored object of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub status: Value,
}

impl Resource {
    pub fn new(kind: ResourceKind, key: ObjectKey) -> Self {
        Self {
            kind,
            metadata: ObjectMeta {
                name: key.name,
                namespace: key.namespace,
                ..ObjectMeta::default()
            },
            spec: Value::Null,
            status: Value::Null,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }

    /// Drops the fields only the holding store may assign.
    pub fn clear_store_fields(&mut self) {
        self.metadata.uid = None;
        self.metadata.resource_version = None;
        self.metadata.creation_timestamp = None;
    }

    /// Copies the store-assigned fields of `other` onto `self`.
    pub fn adopt_store_fields(&mut self, other: &Resource) {
        self.metadata.uid = other.metadata.uid.clone();
        self.metadata.resource_version = other.metadata.resource_version;
        self.metadata.creation_timestamp = other.metadata.creation_timestamp;
    }

    /// `true` when the force-delete escape hatch is set.
    pub fn force_delete_requested(&self) -> bool {
        self.annotation(keys::FORCE_DELETE)
            .and_then(parse_bool)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Cluster health
// ---------------------------------------------------------------------------

/// Liveness classification of a member cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Registered, no heartbeat seen yet.
    #[default]
    Processing,
    Normal,
    Abnormal,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Processing => write!(f, "processing"),
            HealthState::Normal => write!(f, "normal"),
            HealthState::Abnormal => write!(f, "abnormal"),
        }
    }
}

/// Health record persisted in a cluster registration object's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterHealth {
    pub state: HealthState,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ClusterHealth {
    /// Reads the health record from a cluster object's status. A missing or
    /// unrecognisable status reads as the initial `Processing` record.
    pub fn from_resource(resource: &Resource) -> Self {
        if resource.status.is_null() {
            return Self::default();
        }
        serde_json::from_value(resource.status.clone()).unwrap_or_default()
    }

    pub fn to_status(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Body of a cluster registration object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Location of the cluster's declarative store.
    pub store: PathBuf,
}

/// Connection parameters for one managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: ClusterName,
    pub store: PathBuf,
}

impl ClusterConfig {
    /// Builds the connection config from a cluster registration object.
    pub fn from_record(record: &Resource) -> Result<Self, serde_json::Error> {
        let spec: ClusterSpec = serde_json::from_value(record.spec.clone())?;
        Ok(Self {
            name: ClusterName::from(record.metadata.name.clone()),
            store: spec.store,
        })
    }

    /// The registration object that describes this cluster.
    pub fn to_record(&self) -> Resource {
        Resource::new(ResourceKind::Cluster, ObjectKey::cluster_scoped(self.name.0.clone()))
            .with_spec(serde_json::json!({ "store": self.store }))
    }
}

/// One liveness report from a member agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub cluster: ClusterName,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in ResourceKind::replicated() {
            assert_eq!(kind.as_str().parse::<ResourceKind>(), Ok(*kind));
        }
        assert_eq!("RoleBinding".parse::<ResourceKind>(), Ok(ResourceKind::RoleBinding));
        assert_eq!("cluster".parse::<ResourceKind>(), Ok(ResourceKind::Cluster));
        assert!("pod".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn cluster_kind_is_not_replicated() {
        assert!(!ResourceKind::replicated().contains(&ResourceKind::Cluster));
        assert_eq!(ResourceKind::replicated().len(), 11);
    }

    #[test]
    fn only_tenant_and_project_are_delete_protected() {
        let protected: Vec<_> = ResourceKind::replicated()
            .iter()
            .filter(|k| k.is_delete_protected())
            .collect();
        assert_eq!(protected, vec![&ResourceKind::Tenant, &ResourceKind::Project]);
    }

    #[test]
    fn object_key_display_and_parse() {
        let key: ObjectKey = "dev/r1".parse().expect("parse");
        assert_eq!(key, ObjectKey::namespaced("dev", "r1"));
        assert_eq!(key.to_string(), "dev/r1");
        assert_eq!("t1".parse::<ObjectKey>(), Ok(ObjectKey::cluster_scoped("t1")));
        assert!("a/b/c".parse::<ObjectKey>().is_err());
        assert!("".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn parse_bool_accepts_conventional_literals() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("False"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }

    #[test]
    fn store_fields_are_cleared_and_adopted() {
        let mut local = Resource::new(ResourceKind::User, ObjectKey::cluster_scoped("alice"));
        local.metadata.uid = Some("u-1".into());
        local.metadata.resource_version = Some(7);
        local.metadata.creation_timestamp = Some(Utc::now());

        let mut incoming = local.clone();
        incoming.clear_store_fields();
        assert!(incoming.metadata.uid.is_none());
        assert!(incoming.metadata.resource_version.is_none());
        assert!(incoming.metadata.creation_timestamp.is_none());

        incoming.adopt_store_fields(&local);
        assert_eq!(incoming.metadata, local.metadata);
    }

    #[test]
    fn cluster_health_defaults_to_processing() {
        let record = Resource::new(ResourceKind::Cluster, ObjectKey::cluster_scoped("m1"));
        assert_eq!(ClusterHealth::from_resource(&record).state, HealthState::Processing);
    }

    #[test]
    fn cluster_config_from_record() {
        let config = ClusterConfig {
            name: ClusterName::from("m1"),
            store: PathBuf::from("/var/lib/fleet/m1"),
        };
        let record = config.to_record();
        assert_eq!(ClusterConfig::from_record(&record).expect("config"), config);
    }

    #[test]
    fn resource_yaml_omits_empty_fields() {
        let res = Resource::new(ResourceKind::Tenant, ObjectKey::cluster_scoped("t1"));
        let yaml = serde_yaml::to_string(&res).expect("serialize");
        assert!(!yaml.contains("status"));
        assert!(!yaml.contains("uid"));
        let back: Resource = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back, res);
    }
}
