//! Kernel construction: module order, shadowing and all-or-nothing installs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use warden::capabilities::host_rpc::HostRpcOptions;
use warden::capabilities::timers::TimerOptions;
use warden::capabilities::{Binding, CapabilityModule, InstallError};
use warden::config::QuotaConfig;
use warden::kernel::{KernelConfig, KernelError, KernelState, SandboxKernel};
use warden::ledger::ResourceLedger;
use warden::link::ChannelLink;
use warden::types::ResourceKind;

use super::support::{build, call_once, core, echo_link, program, texts, FailingInstall, TaggedLog};

#[tokio::test]
async fn later_module_shadows_earlier_binding() {
    let h = build(
        KernelConfig::default()
            .with_module(CapabilityModule::Console)
            .with_module(CapabilityModule::extension(TaggedLog)),
    );

    let log = h.kernel.resolve("console.log").expect("console.log registered");
    assert_eq!(log.origin(), "tagged_log");
    // Names the later module did not produce still come from the earlier one.
    let warn = h.kernel.resolve("console.warn").expect("console.warn registered");
    assert_eq!(warn.origin(), "console");

    h.kernel
        .run(call_once("console.log", json!(["hi"])))
        .await
        .expect("run should succeed");
    assert_eq!(texts(&h.kernel), vec!["[tagged] hi".to_owned()]);
}

#[tokio::test]
async fn failed_install_releases_earlier_reservations() {
    let ledger = Arc::new(ResourceLedger::default());
    let (link, _server) = echo_link("vm");
    let config = KernelConfig::default()
        .with_module(CapabilityModule::Timers(TimerOptions::default()))
        .with_module(CapabilityModule::HostRpc(HostRpcOptions::default()))
        .with_module(CapabilityModule::extension(FailingInstall));

    let err = SandboxKernel::new(config, core(&ledger), link).expect_err("install must fail");
    assert!(err.is_terminal());
    match err {
        KernelError::ModuleInstall {
            module,
            source: InstallError::MissingResource(_),
        } => assert_eq!(module, "failing"),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(ledger.outstanding(), 0);
    assert_eq!(ledger.used(ResourceKind::TimerSlots), 0);
    assert_eq!(ledger.used(ResourceKind::RpcSlots), 0);
}

#[tokio::test]
async fn exhausted_quota_aborts_construction() {
    let ledger = Arc::new(ResourceLedger::new(&QuotaConfig {
        timer_slots: 1,
        ..QuotaConfig::default()
    }));
    let (link, _server) = echo_link("vm");
    let config =
        KernelConfig::default().with_module(CapabilityModule::Timers(TimerOptions::default()));

    let first = SandboxKernel::new(config.clone(), core(&ledger), Arc::clone(&link))
        .expect("first kernel fits the quota");
    let err = SandboxKernel::new(config, core(&ledger), link)
        .expect_err("second kernel exceeds the quota");
    assert!(matches!(
        err,
        KernelError::ModuleInstall {
            source: InstallError::Quota(_),
            ..
        }
    ));

    first.shutdown().await.expect("shutdown");
    assert_eq!(ledger.used(ResourceKind::TimerSlots), 0);
}

#[tokio::test]
async fn host_rpc_needs_a_connected_link() {
    let ledger = Arc::new(ResourceLedger::default());
    let (link, endpoint) = ChannelLink::pair("vm-down", 4, Duration::from_secs(1));
    drop(endpoint);

    let config =
        KernelConfig::default().with_module(CapabilityModule::HostRpc(HostRpcOptions::default()));
    let err = SandboxKernel::new(config, core(&ledger), Arc::new(link))
        .expect_err("disconnected link must fail the install");
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
async fn zero_output_capacity_is_rejected() {
    let ledger = Arc::new(ResourceLedger::default());
    let (link, _server) = echo_link("vm");
    let config = KernelConfig {
        output_capacity: 0,
        ..KernelConfig::default()
    };
    let err = SandboxKernel::new(config, core(&ledger), link).expect_err("invalid config");
    assert!(matches!(err, KernelError::InvalidConfig(_)));
}

#[tokio::test]
async fn call_depth_beyond_the_stack_limit_is_rejected() {
    let ledger = Arc::new(ResourceLedger::default());
    let (link, _server) = echo_link("vm");
    let config = KernelConfig {
        max_call_depth: 5_000,
        ..KernelConfig::default()
    };
    let err = SandboxKernel::new(config, core(&ledger), link).expect_err("invalid config");
    assert!(matches!(err, KernelError::InvalidConfig(_)));
}

#[tokio::test]
async fn new_kernel_is_ready_and_lists_bindings() {
    let h = build(
        KernelConfig::default()
            .with_module(CapabilityModule::Console)
            .with_module(CapabilityModule::Crypto),
    );

    let health = h.kernel.health();
    assert!(health.is_healthy());
    assert_eq!(health.state, KernelState::Ready);
    assert_eq!(health.output_records, 0);
    assert_eq!(h.kernel.modules(), ["console".to_owned(), "crypto".to_owned()]);

    let names = h.kernel.binding_names();
    assert!(names.contains(&"crypto.sha256".to_owned()));
    assert!(names.contains(&"console.error".to_owned()));
    assert!(h.kernel.resolve("nope").is_none());
}

#[tokio::test]
async fn import_resolution_is_memoized_and_failures_are_not() {
    let h = build(KernelConfig::default().with_module(CapabilityModule::Console));

    let first = h
        .kernel
        .resolve_import("console.log")
        .await
        .expect("resolves");
    let second = h
        .kernel
        .resolve_import("console.log")
        .await
        .expect("served from cache");
    assert_eq!(first.origin(), second.origin());

    assert!(matches!(
        h.kernel.resolve_import("missing").await,
        Err(KernelError::NotFound(name)) if name == "missing"
    ));
}

#[tokio::test]
async fn rebind_replaces_a_host_binding_for_later_calls() {
    let h = build(KernelConfig::default().with_module(CapabilityModule::Console));
    h.kernel
        .resolve_import("console.log")
        .await
        .expect("warm the cache");

    let previous = h
        .kernel
        .rebind(Binding::constant("host", "console.log", json!("replaced")))
        .await
        .expect("rebind");
    assert_eq!(
        previous.map(|b| b.origin().to_owned()),
        Some("console".to_owned())
    );

    let result = h
        .kernel
        .run(call_once("console.log", json!([])))
        .await
        .expect("run");
    assert_eq!(result.value, json!("replaced"));

    let refused = h
        .kernel
        .rebind(Binding::export("guest", "console.log"))
        .await;
    assert!(matches!(refused, Err(KernelError::Registry(_))));
}

#[tokio::test]
async fn empty_module_list_builds_a_bare_kernel() {
    let h = build(KernelConfig::default());
    assert!(h.kernel.binding_names().is_empty());

    let result = h
        .kernel
        .run(program("bare", json!({ "main": [{ "return": { "value": 7 } }] })))
        .await
        .expect("pure guest code runs without capabilities");
    assert_eq!(result.value, json!(7));
}
