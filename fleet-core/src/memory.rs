//! In-process [`ResourceStore`] with an operation journal.
//!
//! Used as the member store in tests and in-process setups. Every accepted
//! write is appended to the journal so callers can assert on write ordering
//! and write counts.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::selector::LabelSelector;
use crate::store::{
    check_version, prepare_create, prepare_status, prepare_update, validate_scope, DeletePolicy,
    ResourceStore,
};
use crate::types::{ObjectKey, Resource, ResourceKind};

/// One accepted write, as recorded in the journal.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Create(Resource),
    Update(Resource),
    UpdateStatus(Resource),
    Delete { kind: ResourceKind, key: ObjectKey },
}

impl StoreOp {
    pub fn kind(&self) -> ResourceKind {
        match self {
            StoreOp::Create(r) | StoreOp::Update(r) | StoreOp::UpdateStatus(r) => r.kind,
            StoreOp::Delete { kind, .. } => *kind,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            StoreOp::Create(r) | StoreOp::Update(r) | StoreOp::UpdateStatus(r) => r.key(),
            StoreOp::Delete { key, .. } => key.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(ResourceKind, ObjectKey), Resource>,
    version: u64,
    journal: Vec<StoreOp>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn stored(&self, kind: ResourceKind, key: &ObjectKey) -> Result<&Resource, StoreError> {
        self.objects
            .get(&(kind, key.clone()))
            .ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.clone(),
            })
    }
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    delete_policy: DeletePolicy,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that enforces the tenancy delete-protection admission rule.
    pub fn with_delete_policy(policy: DeletePolicy) -> Self {
        Self {
            state: Mutex::default(),
            delete_policy: policy,
        }
    }

    /// Inserts an object bypassing admission and the journal. A supplied
    /// `creation_timestamp` is kept, so tests can stage out-of-band objects.
    pub fn seed(&self, resource: Resource) -> Result<Resource, StoreError> {
        validate_scope(resource.kind, &resource.key())?;
        let mut state = self.lock()?;
        let version = state.bump();
        let mut stored = prepare_create(&resource, version);
        if resource.metadata.creation_timestamp.is_some() {
            stored.metadata.creation_timestamp = resource.metadata.creation_timestamp;
        }
        state
            .objects
            .insert((stored.kind, stored.key()), stored.clone());
        Ok(stored)
    }

    /// Every accepted write since creation (or the last [`clear_journal`]).
    ///
    /// [`clear_journal`]: MemoryStore::clear_journal
    pub fn journal(&self) -> Vec<StoreOp> {
        self.lock().map(|s| s.journal.clone()).unwrap_or_default()
    }

    pub fn clear_journal(&self) {
        if let Ok(mut state) = self.lock() {
            state.journal.clear();
        }
    }

    /// Number of objects across all kinds.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.objects.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ResourceStore for MemoryStore {
    fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<Resource, StoreError> {
        self.lock()?.stored(kind, key).cloned()
    }

    fn list(
        &self,
        kind: ResourceKind,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, _), res)| *k == kind && selector.matches(&res.metadata.labels))
            .map(|(_, res)| res.clone())
            .collect())
    }

    fn create(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let key = resource.key();
        validate_scope(resource.kind, &key)?;
        let mut state = self.lock()?;
        if state.objects.contains_key(&(resource.kind, key.clone())) {
            return Err(StoreError::AlreadyExists {
                kind: resource.kind,
                key,
            });
        }
        let version = state.bump();
        let stored = prepare_create(resource, version);
        state.objects.insert((stored.kind, key), stored.clone());
        state.journal.push(StoreOp::Create(stored.clone()));
        Ok(stored)
    }

    fn update(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let key = resource.key();
        let mut state = self.lock()?;
        let current = state.stored(resource.kind, &key)?.clone();
        check_version(&current, resource)?;
        let version = state.bump();
        let next = prepare_update(&current, resource, version);
        state.objects.insert((next.kind, key), next.clone());
        state.journal.push(StoreOp::Update(next.clone()));
        Ok(next)
    }

    fn update_status(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let key = resource.key();
        let mut state = self.lock()?;
        let current = state.stored(resource.kind, &key)?.clone();
        check_version(&current, resource)?;
        let version = state.bump();
        let next = prepare_status(&current, resource, version);
        state.objects.insert((next.kind, key), next.clone());
        state.journal.push(StoreOp::UpdateStatus(next.clone()));
        Ok(next)
    }

    fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let current = state.stored(kind, key)?;
        self.delete_policy.admit(current)?;
        state.objects.remove(&(kind, key.clone()));
        state.journal.push(StoreOp::Delete {
            kind,
            key: key.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Requirement;
    use crate::types::keys;

    fn binding(name: &str) -> Resource {
        Resource::new(ResourceKind::RoleBinding, ObjectKey::namespaced("dev", name))
    }

    #[test]
    fn create_assigns_store_fields() {
        let store = MemoryStore::new();
        let created = store.create(&binding("r1")).expect("create");
        assert_eq!(created.metadata.resource_version, Some(1));
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
    }

    #[test]
    fn duplicate_create_is_already_exists() {
        let store = MemoryStore::new();
        store.create(&binding("r1")).expect("create");
        let err = store.create(&binding("r1")).unwrap_err();
        assert!(err.is_already_exists(), "got: {err}");
    }

    #[test]
    fn update_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&binding("r1")).expect("create");
        let first = store.update(&created).expect("first update");
        assert_eq!(first.metadata.resource_version, Some(2));

        let err = store.update(&created).unwrap_err();
        assert!(err.is_conflict(), "got: {err}");
    }

    #[test]
    fn update_status_leaves_spec_alone() {
        let store = MemoryStore::new();
        let created = store
            .create(&binding("r1").with_spec(serde_json::json!({"role": "admin"})))
            .expect("create");
        let mut patch = created.clone();
        patch.spec = serde_json::Value::Null;
        patch.status = serde_json::json!({"ok": true});
        let updated = store.update_status(&patch).expect("status");
        assert_eq!(updated.spec, serde_json::json!({"role": "admin"}));
        assert_eq!(updated.status, serde_json::json!({"ok": true}));
    }

    #[test]
    fn list_filters_by_kind_and_selector() {
        let store = MemoryStore::new();
        store
            .create(&binding("a").with_label("team", "core"))
            .expect("a");
        store.create(&binding("b")).expect("b");
        store
            .create(&Resource::new(ResourceKind::User, ObjectKey::cluster_scoped("u")))
            .expect("u");

        let all = store
            .list(ResourceKind::RoleBinding, &LabelSelector::everything())
            .expect("list");
        assert_eq!(all.len(), 2);

        let core = store
            .list(
                ResourceKind::RoleBinding,
                &LabelSelector::everything().with(Requirement::Equals("team".into(), "core".into())),
            )
            .expect("list");
        assert_eq!(core.len(), 1);
        assert_eq!(core[0].metadata.name, "a");
    }

    #[test]
    fn protected_delete_needs_force_annotation() {
        let store = MemoryStore::with_delete_policy(DeletePolicy::ProtectTenancy);
        let tenant = store
            .create(&Resource::new(ResourceKind::Tenant, ObjectKey::cluster_scoped("t1")))
            .expect("create");
        let key = tenant.key();
        assert!(matches!(
            store.delete(ResourceKind::Tenant, &key),
            Err(StoreError::Forbidden { .. })
        ));

        let forced = tenant.with_annotation(keys::FORCE_DELETE, "true");
        store.update(&forced).expect("stamp");
        store.delete(ResourceKind::Tenant, &key).expect("delete");
        assert!(store.is_empty());
    }

    #[test]
    fn journal_records_accepted_writes_only() {
        let store = MemoryStore::new();
        let created = store.create(&binding("r1")).expect("create");
        let _ = store.create(&binding("r1"));
        store.delete(created.kind, &created.key()).expect("delete");
        let _ = store.delete(created.kind, &created.key());

        let ops = store.journal();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], StoreOp::Create(_)));
        assert!(matches!(ops[1], StoreOp::Delete { .. }));
    }

    #[test]
    fn seed_keeps_creation_timestamp_and_skips_journal() {
        let store = MemoryStore::new();
        let past = chrono::Utc::now() - chrono::Duration::hours(1);
        let mut res = binding("old");
        res.metadata.creation_timestamp = Some(past);
        let seeded = store.seed(res).expect("seed");
        assert_eq!(seeded.metadata.creation_timestamp, Some(past));
        assert!(store.journal().is_empty());
    }
}
