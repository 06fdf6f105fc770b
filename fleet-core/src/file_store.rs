//! Directory-backed [`ResourceStore`].
//!
//! # Storage layout
//!
//! ```text
//! <root>/
//!   .version                         (last issued resource version)
//!   <kind>/
//!     _cluster/<name>.yaml           (cluster-scoped objects)
//!     <namespace>/<name>.yaml        (namespaced objects)
//! ```
//!
//! Directories are created with mode `0700`, object files with `0600`.
//! Every write goes through a `.yaml.tmp` sibling followed by `rename`, so a
//! reader never observes a half-written object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{io_err, StoreError};
use crate::selector::LabelSelector;
use crate::store::{
    check_version, prepare_create, prepare_status, prepare_update, validate_scope, DeletePolicy,
    ResourceStore,
};
use crate::types::{ObjectKey, Resource, ResourceKind};

const CLUSTER_SCOPE_DIR: &str = "_cluster";
const VERSION_FILE: &str = ".version";

/// A store rooted at a directory on disk.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    delete_policy: DeletePolicy,
    // Serialises read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens (and creates, if needed) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_policy(root, DeletePolicy::Allow)
    }

    pub fn open_with_policy(
        root: impl Into<PathBuf>,
        delete_policy: DeletePolicy,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        ensure_dir(&root)?;
        Ok(Self {
            root,
            delete_policy,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<kind>/<scope>/<name>.yaml`: pure, no I/O.
    pub fn object_path(&self, kind: ResourceKind, key: &ObjectKey) -> PathBuf {
        object_path_at(&self.root, kind, key)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }

    fn read(&self, kind: ResourceKind, key: &ObjectKey) -> Result<Resource, StoreError> {
        let path = self.object_path(kind, key);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    kind,
                    key: key.clone(),
                })
            }
            Err(err) => return Err(io_err(&path, err)),
        };
        serde_yaml::from_str(&contents).map_err(|source| StoreError::Parse { path, source })
    }

    fn write(&self, resource: &Resource) -> Result<(), StoreError> {
        let path = self.object_path(resource.kind, &resource.key());
        if let Some(dir) = path.parent() {
            ensure_dir(dir)?;
        }
        let yaml = serde_yaml::to_string(resource)?;
        write_atomic(&path, yaml.as_bytes())
    }

    fn next_version(&self) -> Result<u64, StoreError> {
        let path = self.root.join(VERSION_FILE);
        let current = match std::fs::read_to_string(&path) {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| StoreError::CorruptCounter {
                    path: path.clone(),
                    raw: raw.trim().to_string(),
                })?,
            // Counter lost: continue above every version already handed out.
            Err(err) if err.kind() == ErrorKind::NotFound => self.highest_stored_version()?,
            Err(err) => return Err(io_err(&path, err)),
        };
        let next = current + 1;
        write_atomic(&path, next.to_string().as_bytes())?;
        Ok(next)
    }

    fn highest_stored_version(&self) -> Result<u64, StoreError> {
        let everything = LabelSelector::everything();
        let mut highest = 0;
        for kind in ResourceKind::replicated()
            .iter()
            .copied()
            .chain(std::iter::once(ResourceKind::Cluster))
        {
            for resource in self.list(kind, &everything)? {
                highest = highest.max(resource.metadata.resource_version.unwrap_or(0));
            }
        }
        Ok(highest)
    }
}

impl ResourceStore for FileStore {
    fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<Resource, StoreError> {
        self.read(kind, key)
    }

    fn list(
        &self,
        kind: ResourceKind,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>, StoreError> {
        let kind_dir = self.root.join(kind.as_str());
        let mut scope_dirs = match std::fs::read_dir(&kind_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|e| e.path())
                .collect::<Vec<_>>(),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(io_err(&kind_dir, err)),
        };
        scope_dirs.sort();

        let mut result = Vec::new();
        for dir in scope_dirs {
            let mut files: Vec<_> = std::fs::read_dir(&dir)
                .map_err(|e| io_err(&dir, e))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("yaml"))
                .collect();
            files.sort();

            for path in files {
                let contents = match std::fs::read_to_string(&path) {
                    Ok(contents) => contents,
                    // Deleted between read_dir and read.
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(io_err(&path, err)),
                };
                let resource: Resource = serde_yaml::from_str(&contents)
                    .map_err(|source| StoreError::Parse { path, source })?;
                if selector.matches(&resource.metadata.labels) {
                    result.push(resource);
                }
            }
        }
        Ok(result)
    }

    fn create(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let key = resource.key();
        validate_scope(resource.kind, &key)?;
        let _guard = self.lock()?;
        if self.object_path(resource.kind, &key).exists() {
            return Err(StoreError::AlreadyExists {
                kind: resource.kind,
                key,
            });
        }
        let stored = prepare_create(resource, self.next_version()?);
        self.write(&stored)?;
        Ok(stored)
    }

    fn update(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let _guard = self.lock()?;
        let current = self.read(resource.kind, &resource.key())?;
        check_version(&current, resource)?;
        let next = prepare_update(&current, resource, self.next_version()?);
        self.write(&next)?;
        Ok(next)
    }

    fn update_status(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let _guard = self.lock()?;
        let current = self.read(resource.kind, &resource.key())?;
        check_version(&current, resource)?;
        let next = prepare_status(&current, resource, self.next_version()?);
        self.write(&next)?;
        Ok(next)
    }

    fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let current = self.read(kind, key)?;
        self.delete_policy.admit(&current)?;
        let path = self.object_path(kind, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                kind,
                key: key.clone(),
            }),
            Err(err) => Err(io_err(&path, err)),
        }
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `<root>/<kind>/<scope>/<name>.yaml`: pure, no I/O.
pub fn object_path_at(root: &Path, kind: ResourceKind, key: &ObjectKey) -> PathBuf {
    let scope = key.namespace.as_deref().unwrap_or(CLUSTER_SCOPE_DIR);
    root.join(kind.as_str())
        .join(scope)
        .join(format!("{}.yaml", key.name))
}

/// Inverse of [`object_path_at`]: maps an object file under `root` back to
/// its kind and key. Returns `None` for anything else (temp files, the
/// version file, unknown kinds).
pub fn identify_path(root: &Path, path: &Path) -> Option<(ResourceKind, ObjectKey)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = relative.iter().map(|p| p.to_str());
    let kind: ResourceKind = parts.next()??.parse().ok()?;
    let scope = parts.next()??;
    let file = parts.next()??;
    if parts.next().is_some() {
        return None;
    }
    let name = file.strip_suffix(".yaml")?;
    if name.is_empty() {
        return None;
    }
    let key = if scope == CLUSTER_SCOPE_DIR {
        ObjectKey::cluster_scoped(name)
    } else {
        ObjectKey::namespaced(scope, name)
    };
    Some((kind, key))
}

fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    std::fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, err));
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::open(dir.path().join("store")).expect("open");
        (dir, store)
    }

    #[test]
    fn object_path_is_correct() {
        let root = Path::new("/srv/fleet");
        assert_eq!(
            object_path_at(root, ResourceKind::RoleBinding, &ObjectKey::namespaced("dev", "r1")),
            PathBuf::from("/srv/fleet/role-binding/dev/r1.yaml")
        );
        assert_eq!(
            object_path_at(root, ResourceKind::Tenant, &ObjectKey::cluster_scoped("t1")),
            PathBuf::from("/srv/fleet/tenant/_cluster/t1.yaml")
        );
    }

    #[test]
    fn identify_path_inverts_object_path() {
        let root = Path::new("/srv/fleet");
        let key = ObjectKey::namespaced("dev", "r1");
        let path = object_path_at(root, ResourceKind::Role, &key);
        assert_eq!(identify_path(root, &path), Some((ResourceKind::Role, key)));
        assert_eq!(identify_path(root, &root.join(".version")), None);
        assert_eq!(identify_path(root, &root.join("role/dev/r1.yaml.tmp")), None);
        assert_eq!(identify_path(root, &root.join("pods/dev/p.yaml")), None);
    }

    #[test]
    fn create_get_roundtrip() {
        let (_dir, store) = store();
        let created = store
            .create(&Resource::new(ResourceKind::User, ObjectKey::cluster_scoped("alice")))
            .expect("create");
        let loaded = store
            .get(ResourceKind::User, &ObjectKey::cluster_scoped("alice"))
            .expect("get");
        assert_eq!(loaded, created);
    }

    #[test]
    fn versions_increase_across_writes() {
        let (_dir, store) = store();
        let a = store
            .create(&Resource::new(ResourceKind::User, ObjectKey::cluster_scoped("a")))
            .expect("a");
        let b = store
            .create(&Resource::new(ResourceKind::User, ObjectKey::cluster_scoped("b")))
            .expect("b");
        let a2 = store.update(&a).expect("update");
        assert_eq!(a.metadata.resource_version, Some(1));
        assert_eq!(b.metadata.resource_version, Some(2));
        assert_eq!(a2.metadata.resource_version, Some(3));
    }

    #[test]
    fn corrupt_version_counter_is_an_error() {
        let (_dir, store) = store();
        let created = store
            .create(&Resource::new(ResourceKind::User, ObjectKey::cluster_scoped("alice")))
            .expect("create");
        let mut latest = created;
        for _ in 0..10 {
            latest = store.update(&latest).expect("update");
        }
        std::fs::write(store.root().join(VERSION_FILE), "garbage").expect("corrupt");

        let err = store.update(&latest).unwrap_err();
        assert!(matches!(err, StoreError::CorruptCounter { .. }), "got: {err}");
        let stored = store
            .get(ResourceKind::User, &ObjectKey::cluster_scoped("alice"))
            .expect("get");
        assert_eq!(stored.metadata.resource_version, Some(11));
    }

    #[test]
    fn lost_version_counter_resumes_above_stored_versions() {
        let (_dir, store) = store();
        let mut latest = store
            .create(&Resource::new(ResourceKind::Tenant, ObjectKey::cluster_scoped("acme")))
            .expect("create");
        for _ in 0..4 {
            latest = store.update(&latest).expect("update");
        }
        assert_eq!(latest.metadata.resource_version, Some(5));
        std::fs::remove_file(store.root().join(VERSION_FILE)).expect("remove counter");

        let next = store.update(&latest).expect("update");
        assert_eq!(next.metadata.resource_version, Some(6));
        let other = store
            .create(&Resource::new(ResourceKind::User, ObjectKey::cluster_scoped("bob")))
            .expect("create");
        assert_eq!(other.metadata.resource_version, Some(7));
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let (_dir, store) = store();
        let res = Resource::new(ResourceKind::User, ObjectKey::cluster_scoped("alice"));
        store.create(&res).expect("create");
        let path = store.object_path(res.kind, &res.key());
        assert!(path.exists());
        assert!(!path.with_file_name("alice.yaml.tmp").exists());
    }

    #[test]
    fn missing_object_is_not_found() {
        let (_dir, store) = store();
        let err = store
            .get(ResourceKind::Tenant, &ObjectKey::cluster_scoped("nope"))
            .unwrap_err();
        assert!(err.is_not_found());
        let err = store
            .delete(ResourceKind::Tenant, &ObjectKey::cluster_scoped("nope"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_empty_when_kind_dir_missing() {
        let (_dir, store) = store();
        let list = store
            .list(ResourceKind::Namespace, &LabelSelector::everything())
            .expect("list");
        assert!(list.is_empty());
    }

    #[test]
    fn corrupt_object_reports_parse_error_with_path() {
        let (_dir, store) = store();
        let key = ObjectKey::cluster_scoped("broken");
        let path = store.object_path(ResourceKind::User, &key);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, ": : not yaml [").expect("write");
        let err = store.get(ResourceKind::User, &key).unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[cfg(unix)]
    #[test]
    fn store_dir_created_with_perms() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = store();
        let mode = std::fs::metadata(store.root())
            .expect("meta")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o700);
    }
}
