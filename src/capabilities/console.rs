//! Console-style logging into the kernel's output cache.
//!
//! `console.log` and `console.info` capture to stdout, `console.warn` and
//! `console.error` to stderr. Arguments are joined with a single space;
//! strings are written verbatim, other values as compact JSON.

use super::{Binding, InstallContext, InstallError};
use crate::engine::Value;
use crate::kernel::output::CaptureSink;
use crate::types::StreamKind;

const MODULE: &str = "console";

/// Render guest arguments the way a console would print them.
pub fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn writer(sink: &CaptureSink, name: &str, stream: StreamKind) -> Binding {
    let sink = sink.clone();
    Binding::function(MODULE, name, move |args| {
        sink.write(stream, render_args(args));
        Ok(Value::Null)
    })
}

/// Install the console bindings.
///
/// # Errors
///
/// Never fails; the signature matches the other modules.
pub fn install(ctx: &mut InstallContext<'_>) -> Result<Vec<Binding>, InstallError> {
    let sink = ctx.capture();
    Ok(vec![
        writer(&sink, "console.log", StreamKind::Stdout),
        writer(&sink, "console.info", StreamKind::Stdout),
        writer(&sink, "console.warn", StreamKind::Stderr),
        writer(&sink, "console.error", StreamKind::Stderr),
    ])
}
