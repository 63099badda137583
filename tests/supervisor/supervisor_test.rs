//! Kernel supervisor: spawning, run accounting, retirement and replacement.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use warden::capabilities::timers::TimerOptions;
use warden::capabilities::CapabilityModule;
use warden::kernel::{CallOptions, KernelConfig, KernelError};
use warden::ledger::ResourceLedger;
use warden::link::{ChannelLink, VmLink};
use warden::supervisor::{KernelSupervisor, SupervisorError};
use warden::vmdb::{InMemoryVmStore, VmStore};

use super::support::{call_once, echo, echo_link, program, Panicky};

fn supervisor(config: KernelConfig) -> (Arc<KernelSupervisor>, Arc<InMemoryVmStore>) {
    let store = Arc::new(InMemoryVmStore::new());
    let ledger = Arc::new(ResourceLedger::default());
    let sup = KernelSupervisor::new(config, ledger, Arc::clone(&store) as Arc<dyn VmStore>);
    (sup, store)
}

fn console_and_timers() -> KernelConfig {
    KernelConfig::default()
        .with_module(CapabilityModule::Console)
        .with_module(CapabilityModule::Timers(TimerOptions::default()))
}

#[tokio::test]
async fn spawn_registers_the_vm_and_counts_successful_runs() {
    let (sup, store) = supervisor(console_and_timers());
    let (link, _server) = echo_link("vm-alpha");

    let kernel = sup.spawn(link).await.expect("spawn");
    let id = kernel.id();
    assert_eq!(
        kernel.db_entry().map(|e| e.id.clone()),
        Some("vm-alpha".to_owned())
    );
    assert_eq!(sup.len().await, 1);

    sup.run(id, call_once("console.log", json!(["hi"])), CallOptions::default())
        .await
        .expect("run");
    let failed = sup
        .run(
            id,
            program("bad", json!({ "main": [{ "throw": { "message": "x" } }] })),
            CallOptions::default(),
        )
        .await;
    assert!(matches!(
        failed,
        Err(SupervisorError::Kernel(KernelError::GuestFault { .. }))
    ));

    let entry = store.get("vm-alpha").await.expect("get").expect("registered");
    assert_eq!(entry.run_count, 1);
    assert!(entry.last_run_at.is_some());
}

#[tokio::test]
async fn same_vm_reuses_its_record() {
    let (sup, store) = supervisor(KernelConfig::default());
    let (link, _server) = echo_link("vm-shared");

    let first = sup.spawn(Arc::clone(&link)).await.expect("spawn");
    let second = sup.spawn(link).await.expect("spawn");
    assert_ne!(first.id(), second.id());
    assert_eq!(store.list().await.expect("list").len(), 1);
    assert_eq!(sup.health().await.len(), 2);
}

#[tokio::test]
async fn exported_entry_points_are_callable_through_the_supervisor() {
    let (sup, store) = supervisor(KernelConfig::default());
    let (link, _server) = echo_link("vm-calls");
    let id = sup.spawn(link).await.expect("spawn").id();

    sup.run(
        id,
        program(
            "lib",
            json!({ "exports": { "double": { "params": ["x"], "body": [
                { "return": { "value": [{ "$var": "x" }, { "$var": "x" }] } }
            ] } } }),
        ),
        CallOptions::default(),
    )
    .await
    .expect("define");
    let result = sup
        .call(id, "double", vec![json!(3)], CallOptions::default())
        .await
        .expect("call");
    assert_eq!(result.value, json!([3, 3]));

    let entry = store.get("vm-calls").await.expect("get").expect("registered");
    assert_eq!(entry.run_count, 2);
}

#[tokio::test]
async fn retire_returns_output_and_forgets_the_kernel() {
    let (sup, _store) = supervisor(console_and_timers());
    let (link, _server) = echo_link("vm-retire");
    let id = sup.spawn(link).await.expect("spawn").id();

    sup.run(id, call_once("console.log", json!(["last words"])), CallOptions::default())
        .await
        .expect("run");
    let output = sup.retire(id).await.expect("retire");
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].text, "last words");
    assert!(sup.is_empty().await);
    assert_eq!(sup.ledger().outstanding(), 0);

    assert!(matches!(
        sup.retire(id).await,
        Err(SupervisorError::UnknownKernel(k)) if k == id
    ));
    assert!(matches!(
        sup.run(id, call_once("console.log", json!([])), CallOptions::default()).await,
        Err(SupervisorError::UnknownKernel(_))
    ));
}

#[tokio::test]
async fn closed_link_retires_its_kernels() {
    let (sup, _store) = supervisor(console_and_timers());
    let (link, endpoint) = ChannelLink::pair("vm-gone", 4, Duration::from_secs(1));
    let server = endpoint.serve(echo);
    let link: Arc<dyn VmLink> = Arc::new(link);

    sup.spawn(Arc::clone(&link)).await.expect("spawn");
    assert_eq!(sup.len().await, 1);

    server.abort();
    let _ = server.await;

    let started = std::time::Instant::now();
    while !sup.is_empty().await {
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "kernel was not retired after the link closed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sup.ledger().outstanding(), 0);
}

#[tokio::test]
async fn poisoned_kernels_are_replaced_on_the_same_link() {
    let (sup, _store) = supervisor(
        console_and_timers().with_module(CapabilityModule::extension(Panicky)),
    );
    let (link, _server) = echo_link("vm-poison");
    let healthy = sup.spawn(Arc::clone(&link)).await.expect("spawn").id();
    let doomed = sup.spawn(link).await.expect("spawn").id();

    let err = sup
        .run(doomed, call_once("panicky.boom", json!([])), CallOptions::default())
        .await
        .expect_err("panics");
    assert!(matches!(
        err,
        SupervisorError::Kernel(KernelError::EngineAnomaly { .. })
    ));

    let report = sup.replace_poisoned().await;
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].retired, doomed);
    let fresh = report[0]
        .replacement
        .as_ref()
        .copied()
        .expect("replacement built");

    assert!(sup.get(doomed).await.is_none());
    assert!(sup.get(healthy).await.is_some());
    let replacement = sup.get(fresh).await.expect("replacement is live");
    assert_eq!(replacement.link().vm_id(), "vm-poison");
    assert!(replacement.health().is_healthy());
    // One timer slot per live kernel.
    assert_eq!(sup.ledger().outstanding(), 2);
}

#[tokio::test]
async fn retire_all_empties_the_supervisor() {
    let (sup, _store) = supervisor(console_and_timers());
    let (link, _server) = echo_link("vm-many");
    for _ in 0..3 {
        sup.spawn(Arc::clone(&link)).await.expect("spawn");
    }

    let results = sup.retire_all().await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert!(sup.is_empty().await);
    assert_eq!(sup.ledger().outstanding(), 0);
}
