//! Requests forwarded to the outer VM process over the link.
//!
//! Bindings run on the kernel's blocking execution thread and wait for the
//! link with the runtime handle captured at install time, giving up as soon
//! as the call is interrupted. Link failures come back to the guest call as
//! [`BindingError::Link`]; they never poison the kernel.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{str_arg, Binding, BindingError, InstallContext, InstallError};
use crate::engine::{InterruptHandle, Value};
use crate::link::{LinkError, LinkRequest, VmLink};
use crate::types::{KernelId, ResourceKind};

const MODULE: &str = "host_rpc";

/// Options for the host RPC module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HostRpcOptions {
    /// Methods the guest may call. Empty allows every method.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Per-call timeout on top of the link's own.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Interval at which a waiting request re-checks the interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

struct Forwarder {
    kernel: KernelId,
    link: Arc<dyn VmLink>,
    runtime: tokio::runtime::Handle,
    interrupt: InterruptHandle,
    timeout: Option<Duration>,
}

impl Forwarder {
    fn send(&self, request: LinkRequest) -> Result<Value, BindingError> {
        if self.interrupt.is_triggered() {
            return Err(BindingError::Interrupted);
        }
        let link = Arc::clone(&self.link);
        let interrupt = self.interrupt.clone();
        let timeout = self.timeout;
        let response = self.runtime.block_on(async move {
            let exchange = async {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, link.request(request)).await {
                        Ok(result) => result.map_err(BindingError::from),
                        Err(_) => Err(BindingError::Link(LinkError::Timeout(limit))),
                    },
                    None => link.request(request).await.map_err(BindingError::from),
                }
            };
            tokio::select! {
                result = exchange => result,
                () = interrupted(&interrupt) => Err(BindingError::Interrupted),
            }
        })?;
        Ok(response.into_result()?)
    }
}

/// Resolves once the interrupt flag is set. The pending link request is
/// dropped with it.
async fn interrupted(interrupt: &InterruptHandle) {
    let mut poll = tokio::time::interval(INTERRUPT_POLL);
    loop {
        poll.tick().await;
        if interrupt.is_triggered() {
            return;
        }
    }
}

/// Install the host RPC bindings. Holds one RPC slot for the kernel's lifetime.
///
/// # Errors
///
/// Returns [`InstallError::MissingResource`] when the link is down,
/// [`InstallError::Incompatible`] outside a tokio runtime, and
/// [`InstallError::Quota`] when no RPC slot is free.
pub fn install(
    ctx: &mut InstallContext<'_>,
    opts: &HostRpcOptions,
) -> Result<Vec<Binding>, InstallError> {
    let link = ctx.link();
    if !link.is_connected() {
        return Err(InstallError::MissingResource(format!(
            "vm link {} is disconnected",
            link.vm_id()
        )));
    }
    let runtime = ctx.runtime().ok_or_else(|| {
        InstallError::Incompatible("host_rpc needs a tokio runtime at construction".to_owned())
    })?;
    ctx.reserve(ResourceKind::RpcSlots, 1)?;

    let vm_id = link.vm_id().to_owned();
    let forwarder = Arc::new(Forwarder {
        kernel: ctx.kernel_id(),
        link,
        runtime,
        interrupt: ctx.interrupt(),
        timeout: opts.timeout_ms.map(Duration::from_millis),
    });
    let allowed = Arc::new(opts.methods.clone());

    let f = Arc::clone(&forwarder);
    let call = Binding::function(MODULE, "host.call", move |args| {
        let method = str_arg(args, 0, "method")?;
        if !allowed.is_empty() && !allowed.iter().any(|m| m == method) {
            return Err(BindingError::Denied(format!(
                "host method '{method}' is not allowed"
            )));
        }
        let params = args.get(1).cloned().unwrap_or(Value::Null);
        f.send(LinkRequest::rpc(f.kernel, method, params))
    });

    let f = Arc::clone(&forwarder);
    let ping = Binding::function(MODULE, "host.ping", move |_| {
        f.send(LinkRequest::ping(f.kernel))?;
        Ok(Value::Bool(true))
    });

    Ok(vec![
        call,
        ping,
        Binding::constant(MODULE, "host.vm_id", Value::String(vm_id)),
    ])
}
