use serde_json::json;

use warden::capabilities::timers::TimerOptions;
use warden::capabilities::CapabilityModule;
use warden::kernel::{KernelConfig, KernelError};

use super::support::{build, call_once};

fn timers(max_sleep_ms: u64) -> KernelConfig {
    KernelConfig::default().with_module(CapabilityModule::Timers(TimerOptions { max_sleep_ms }))
}

#[tokio::test]
async fn now_is_rfc3339() {
    let h = build(timers(100));
    let result = h
        .kernel
        .run(call_once("timers.now", json!([])))
        .await
        .expect("run");
    let text = result.value.as_str().expect("string");
    assert!(chrono::DateTime::parse_from_rfc3339(text).is_ok());
}

#[tokio::test]
async fn short_sleep_completes() {
    let h = build(timers(100));
    let result = h
        .kernel
        .run(call_once("timers.sleep", json!([20])))
        .await
        .expect("run");
    assert_eq!(result.value, json!(null));
    assert!(result.elapsed.as_millis() >= 20);
}

#[tokio::test]
async fn sleep_over_the_limit_is_refused() {
    let h = build(timers(100));
    let err = h
        .kernel
        .run(call_once("timers.sleep", json!([101])))
        .await
        .expect_err("over max_sleep_ms");
    match err {
        KernelError::GuestFault { message } => assert!(message.contains("exceeds limit")),
        other => panic!("expected guest fault, got {other}"),
    }
}

#[tokio::test]
async fn uptime_is_monotonic() {
    let h = build(timers(100));
    let first = h
        .kernel
        .run(call_once("timers.uptime_ms", json!([])))
        .await
        .expect("run");
    let second = h
        .kernel
        .run(call_once("timers.uptime_ms", json!([])))
        .await
        .expect("run");
    assert!(second.value.as_u64() >= first.value.as_u64());
}
