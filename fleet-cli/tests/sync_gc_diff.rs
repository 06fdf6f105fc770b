use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use fleet_core::{
    keys, DeletePolicy, FileStore, ObjectKey, Resource, ResourceKind, ResourceStore,
};

fn fleet_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fleet"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("NO_COLOR", "1");
    cmd
}

struct Stores {
    home: TempDir,
    pivot: FileStore,
    local: FileStore,
}

impl Stores {
    fn new() -> Self {
        let home = TempDir::new().expect("home");
        let pivot = FileStore::open(home.path().join("pivot")).expect("pivot");
        let local = FileStore::open_with_policy(home.path().join("local"), DeletePolicy::ProtectTenancy)
            .expect("local");
        Self { home, pivot, local }
    }

    fn cmd(&self, args: &[&str]) -> Command {
        let mut cmd = fleet_cmd(self.home.path());
        cmd.args(args)
            .arg("--pivot")
            .arg(self.pivot.root())
            .arg("--local")
            .arg(self.local.root());
        cmd
    }
}

fn tenant(name: &str) -> Resource {
    Resource::new(ResourceKind::Tenant, ObjectKey::cluster_scoped(name))
        .with_annotation(keys::SYNC, "true")
        .with_spec(serde_json::json!({"admins": ["alice"]}))
}

#[test]
fn dry_run_sync_reports_and_writes_nothing() {
    let stores = Stores::new();
    stores.pivot.create(&tenant("acme")).expect("seed");

    stores
        .cmd(&["sync", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("[dry-run]"))
        .stdout(contains("would create"))
        .stdout(contains("acme"));

    let err = stores
        .local
        .get(ResourceKind::Tenant, &ObjectKey::cluster_scoped("acme"))
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn sync_creates_mirror_then_reports_in_sync() {
    let stores = Stores::new();
    stores.pivot.create(&tenant("acme")).expect("seed");

    stores
        .cmd(&["sync", "--kind", "tenant"])
        .assert()
        .success()
        .stdout(contains("created"));
    let mirror = stores
        .local
        .get(ResourceKind::Tenant, &ObjectKey::cluster_scoped("acme"))
        .expect("mirror");
    assert!(mirror.annotation(keys::SYNC_VERSION).is_some());

    stores
        .cmd(&["sync", "--kind", "tenant"])
        .assert()
        .success()
        .stdout(contains("1 in sync"));
}

#[test]
fn gc_dry_run_keeps_orphan_and_gc_removes_it() {
    let stores = Stores::new();
    stores.local.create(&tenant("gone")).expect("orphan");
    let key = ObjectKey::cluster_scoped("gone");

    stores
        .cmd(&["gc", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("1 would delete"));
    assert!(stores.local.get(ResourceKind::Tenant, &key).is_ok());

    stores
        .cmd(&["gc"])
        .assert()
        .success()
        .stdout(contains("1 deleted"));
    assert!(stores
        .local
        .get(ResourceKind::Tenant, &key)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn diff_shows_pending_pivot_change() {
    let stores = Stores::new();
    let created = stores.pivot.create(&tenant("acme")).expect("seed");
    stores.cmd(&["sync"]).assert().success();

    stores
        .cmd(&["diff", "tenant", "acme"])
        .assert()
        .success()
        .stdout(contains("No differences"));

    stores
        .pivot
        .update(&created.with_spec(serde_json::json!({"admins": ["alice", "sentinel-bob"]})))
        .expect("update");
    let assert = stores.cmd(&["diff", "tenant", "acme"]).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    assert!(
        stdout
            .lines()
            .any(|line| line.starts_with('+') && line.contains("sentinel-bob")),
        "expected an added line in:\n{stdout}"
    );
}

#[test]
fn unknown_kind_is_rejected() {
    let stores = Stores::new();
    stores
        .cmd(&["sync", "--kind", "pod"])
        .assert()
        .failure()
        .stderr(contains("unknown resource kind"));
}
