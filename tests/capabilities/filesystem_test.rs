//! Scoped filesystem access.

use std::path::Path;

use serde_json::json;

use warden::capabilities::filesystem::{resolve_guest_path, FilesystemOptions};
use warden::capabilities::{BindingError, CapabilityModule, InstallError};
use warden::kernel::{KernelConfig, KernelError};
use warden::ledger::QuotaError;
use warden::types::ResourceKind;

use super::support::{build, call_once, echo_link, core, program};

fn fs_config(root: &Path, quota_bytes: u64, read_only: bool) -> KernelConfig {
    KernelConfig::default().with_module(CapabilityModule::Filesystem(FilesystemOptions {
        root: root.to_path_buf(),
        quota_bytes,
        read_only,
    }))
}

#[test]
fn traversal_and_absolute_paths_are_denied() {
    let tmp = tempfile::tempdir().expect("tempdir");
    assert!(matches!(
        resolve_guest_path(tmp.path(), "../etc/passwd"),
        Err(BindingError::Denied(_))
    ));
    assert!(matches!(
        resolve_guest_path(tmp.path(), "a/../../b"),
        Err(BindingError::Denied(_))
    ));
    assert!(matches!(
        resolve_guest_path(tmp.path(), "/etc/passwd"),
        Err(BindingError::Denied(_))
    ));

    let inside = resolve_guest_path(tmp.path(), "a/./b/../c.txt").expect("stays inside");
    assert_eq!(inside, tmp.path().join("a").join("c.txt"));
}

#[cfg(unix)]
#[test]
fn symlink_escape_is_denied() {
    let outside = tempfile::tempdir().expect("outside");
    let root = tempfile::tempdir().expect("root");
    std::os::unix::fs::symlink(outside.path(), root.path().join("leak")).expect("symlink");

    assert!(matches!(
        resolve_guest_path(root.path(), "leak/secret.txt"),
        Err(BindingError::Denied(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn dangling_symlink_cannot_create_files_outside_the_root() {
    let outside = tempfile::tempdir().expect("outside");
    let root = tempfile::tempdir().expect("root");
    let target = outside.path().join("planted.txt");
    std::os::unix::fs::symlink(&target, root.path().join("drop.txt")).expect("symlink");

    assert!(matches!(
        resolve_guest_path(root.path(), "drop.txt"),
        Err(BindingError::Denied(_))
    ));

    let h = build(fs_config(root.path(), 1024, false));
    let err = h
        .kernel
        .run(call_once("fs.write", json!(["drop.txt", "payload"])))
        .await
        .expect_err("write through a dangling link is denied");
    assert!(err.is_guest_fault());
    assert!(!target.exists());
}

#[cfg(unix)]
#[test]
fn symlink_inside_the_root_is_followed() {
    let root = tempfile::tempdir().expect("root");
    std::fs::create_dir(root.path().join("real")).expect("dir");
    std::os::unix::fs::symlink(root.path().join("real"), root.path().join("alias"))
        .expect("symlink");

    let resolved = resolve_guest_path(root.path(), "alias/new.txt").expect("stays inside");
    assert_eq!(resolved, root.path().join("alias").join("new.txt"));
}

#[tokio::test]
async fn list_reports_every_entry() {
    let tmp = tempfile::tempdir().expect("tempdir");
    std::fs::write(tmp.path().join("b.txt"), "b").expect("seed");
    std::fs::write(tmp.path().join("a.txt"), "a").expect("seed");
    std::fs::create_dir(tmp.path().join("sub")).expect("dir");
    let h = build(fs_config(tmp.path(), 1024, true));

    let listed = h
        .kernel
        .run(call_once("fs.list", json!([])))
        .await
        .expect("list");
    assert_eq!(listed.value, json!(["a.txt", "b.txt", "sub"]));

    let err = h
        .kernel
        .run(call_once("fs.list", json!(["missing"])))
        .await
        .expect_err("listing a missing directory fails");
    assert!(err.is_guest_fault());
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = build(fs_config(tmp.path(), 1024, false));

    let result = h
        .kernel
        .run(program(
            "notes",
            json!({ "main": [
                { "call": { "target": "fs.write", "args": ["notes/today.txt", "hello"], "into": "n" } },
                { "call": { "target": "fs.read", "args": ["notes/today.txt"], "into": "text" } },
                { "call": { "target": "fs.list", "args": ["notes"], "into": "names" } },
                { "return": { "value": {
                    "written": { "$var": "n" },
                    "text": { "$var": "text" },
                    "names": { "$var": "names" }
                } } }
            ] }),
        ))
        .await
        .expect("run");

    assert_eq!(
        result.value,
        json!({ "written": 5, "text": "hello", "names": ["today.txt"] })
    );
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("notes/today.txt")).expect("host sees file"),
        "hello"
    );

    let removed = h
        .kernel
        .run(call_once("fs.remove", json!(["notes/today.txt"])))
        .await
        .expect("remove");
    assert_eq!(removed.value, json!(true));
    let exists = h
        .kernel
        .run(call_once("fs.exists", json!(["notes/today.txt"])))
        .await
        .expect("exists");
    assert_eq!(exists.value, json!(false));
}

#[tokio::test]
async fn writes_past_the_quota_fail_with_a_quota_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = build(fs_config(tmp.path(), 8, false));

    h.kernel
        .run(call_once("fs.write", json!(["a.txt", "12345"])))
        .await
        .expect("fits");
    let err = h
        .kernel
        .run(call_once("fs.write", json!(["b.txt", "12345"])))
        .await
        .expect_err("over quota");
    assert!(matches!(
        err,
        KernelError::Quota(QuotaError::Exceeded {
            kind: ResourceKind::StorageBytes,
            requested: 5,
            available: 3,
        })
    ));
    assert!(!tmp.path().join("b.txt").exists());

    // Overwriting counts the old size as freed.
    h.kernel
        .run(call_once("fs.write", json!(["a.txt", "12345678"])))
        .await
        .expect("overwrite fits");
}

#[tokio::test]
async fn read_only_root_has_no_mutating_bindings() {
    let tmp = tempfile::tempdir().expect("tempdir");
    std::fs::write(tmp.path().join("seed.txt"), "seed").expect("seed");
    let h = build(fs_config(tmp.path(), 1024, true));

    let read = h
        .kernel
        .run(call_once("fs.read", json!(["seed.txt"])))
        .await
        .expect("read allowed");
    assert_eq!(read.value, json!("seed"));

    assert!(h.kernel.resolve("fs.write").is_none());
    assert!(h.kernel.resolve("fs.remove").is_none());
    let err = h
        .kernel
        .run(call_once("fs.write", json!(["x.txt", "x"])))
        .await
        .expect_err("write is not importable");
    assert!(err.is_guest_fault());
}

#[tokio::test]
async fn escaping_path_from_guest_is_a_guest_fault() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = build(fs_config(tmp.path(), 1024, false));
    let err = h
        .kernel
        .run(call_once("fs.read", json!(["../outside"])))
        .await
        .expect_err("denied");
    match err {
        KernelError::GuestFault { message } => assert!(message.contains("access denied")),
        other => panic!("expected guest fault, got {other}"),
    }
}

#[tokio::test]
async fn missing_root_fails_install() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ledger = std::sync::Arc::new(warden::ledger::ResourceLedger::default());
    let (link, _server) = echo_link("vm");
    let err = warden::kernel::SandboxKernel::new(
        fs_config(&tmp.path().join("absent"), 1024, false),
        core(&ledger),
        link,
    )
    .expect_err("root does not exist");
    assert!(matches!(
        err,
        KernelError::ModuleInstall {
            source: InstallError::MissingResource(_),
            ..
        }
    ));
    assert_eq!(ledger.outstanding(), 0);
}

#[tokio::test]
async fn quota_bytes_are_reserved_with_the_core() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = build(fs_config(tmp.path(), 4096, false));
    assert_eq!(h.ledger.used(ResourceKind::StorageBytes), 4096);

    h.kernel.shutdown().await.expect("shutdown");
    assert_eq!(h.ledger.used(ResourceKind::StorageBytes), 0);
}
