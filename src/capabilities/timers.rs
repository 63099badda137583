//! Clock access and bounded, interruptible sleeping.

use std::time::{Duration, Instant};

use serde::Deserialize;

use super::{u64_arg, Binding, BindingError, InstallContext, InstallError};
use crate::engine::Value;
use crate::types::ResourceKind;

const MODULE: &str = "timers";

/// Granularity at which a sleeping binding re-checks the interrupt flag.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Options for the timers module.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimerOptions {
    /// Longest single `timers.sleep` the guest may request.
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,
}

impl Default for TimerOptions {
    fn default() -> Self {
        Self {
            max_sleep_ms: default_max_sleep_ms(),
        }
    }
}

fn default_max_sleep_ms() -> u64 {
    5_000
}

/// Install the timer bindings. Holds one timer slot for the kernel's lifetime.
///
/// # Errors
///
/// Returns [`InstallError::Quota`] when no timer slot is free.
pub fn install(
    ctx: &mut InstallContext<'_>,
    opts: &TimerOptions,
) -> Result<Vec<Binding>, InstallError> {
    ctx.reserve(ResourceKind::TimerSlots, 1)?;

    let started = Instant::now();
    let interrupt = ctx.interrupt();
    let max_sleep = opts.max_sleep_ms;

    Ok(vec![
        Binding::function(MODULE, "timers.now", |_| {
            Ok(Value::String(chrono::Utc::now().to_rfc3339()))
        }),
        Binding::function(MODULE, "timers.uptime_ms", move |_| {
            let ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            Ok(Value::from(ms))
        }),
        Binding::function(MODULE, "timers.sleep", move |args| {
            let ms = u64_arg(args, 0, "milliseconds")?;
            if ms > max_sleep {
                return Err(BindingError::InvalidArgument(format!(
                    "sleep of {ms}ms exceeds limit of {max_sleep}ms"
                )));
            }
            let deadline = Instant::now()
                .checked_add(Duration::from_millis(ms))
                .ok_or_else(|| BindingError::InvalidArgument("sleep out of range".to_owned()))?;
            loop {
                if interrupt.is_triggered() {
                    return Err(BindingError::Interrupted);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Value::Null);
                }
                std::thread::sleep(deadline.saturating_duration_since(now).min(SLEEP_SLICE));
            }
        }),
    ])
}
