//! Host RPC allowlist and per-call timeouts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use warden::capabilities::host_rpc::HostRpcOptions;
use warden::capabilities::CapabilityModule;
use warden::kernel::{CallOptions, KernelConfig, KernelError, KernelState, SandboxKernel};
use warden::ledger::ResourceLedger;
use warden::link::{ChannelLink, LinkError};

use super::support::{build, call_once, core, program};

#[tokio::test]
async fn methods_outside_the_allowlist_are_denied() {
    let h = build(KernelConfig::default().with_module(CapabilityModule::HostRpc(
        HostRpcOptions {
            methods: vec!["status".to_owned()],
            timeout_ms: None,
        },
    )));

    h.kernel
        .run(call_once("host.call", json!(["status"])))
        .await
        .expect("allowed method");

    let err = h
        .kernel
        .run(call_once("host.call", json!(["reboot"])))
        .await
        .expect_err("not allowed");
    match err {
        KernelError::GuestFault { message } => assert!(message.contains("reboot")),
        other => panic!("expected guest fault, got {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_outer_process_times_out_the_call() {
    let ledger = Arc::new(ResourceLedger::default());
    let (link, mut endpoint) = ChannelLink::pair("vm-slow", 4, Duration::from_secs(5));
    // Accept requests but never answer them.
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(envelope) = endpoint.recv().await {
            held.push(envelope);
        }
    });

    let kernel = SandboxKernel::new(
        KernelConfig::default().with_module(CapabilityModule::HostRpc(HostRpcOptions {
            methods: Vec::new(),
            timeout_ms: Some(40),
        })),
        core(&ledger),
        Arc::new(link),
    )
    .expect("kernel");

    let err = kernel
        .run(call_once("host.call", json!(["status", Value::Null])))
        .await
        .expect_err("no answer");
    assert!(matches!(
        err,
        KernelError::Link {
            source: LinkError::Timeout(d),
            ..
        } if d == Duration::from_millis(40)
    ));
    assert!(!kernel.is_poisoned());
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deadline_abandons_a_slow_link_request_without_poisoning() {
    let ledger = Arc::new(ResourceLedger::default());
    // The link would wait far longer than the kernel's grace period.
    let (link, mut endpoint) = ChannelLink::pair("vm-sluggish", 4, Duration::from_secs(10));
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(envelope) = endpoint.recv().await {
            held.push(envelope);
        }
    });

    let kernel = SandboxKernel::new(
        KernelConfig::default()
            .with_cancel_grace(Duration::from_millis(200))
            .with_module(CapabilityModule::HostRpc(HostRpcOptions::default())),
        core(&ledger),
        Arc::new(link),
    )
    .expect("kernel");

    let started = std::time::Instant::now();
    let err = kernel
        .run_with(
            call_once("host.call", json!(["status", Value::Null])),
            CallOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .expect_err("deadline passes before the reply");
    assert!(matches!(err, KernelError::Timeout(d) if d == Duration::from_millis(100)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!kernel.is_poisoned());
    assert_eq!(kernel.state(), KernelState::Ready);

    let value = kernel
        .run(program("local", json!({ "main": [{ "return": { "value": 7 } }] })))
        .await
        .expect("kernel still serves calls")
        .value;
    assert_eq!(value, json!(7));
    server.abort();
}
