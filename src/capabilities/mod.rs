//! Capability modules: the only way host functionality reaches guest code.
//!
//! Each module installs itself into a kernel through an [`InstallContext`]
//! and returns the named [`Binding`]s it exposes. The kernel inserts them
//! into its registry in module order, so a later module that produces a
//! binding under an existing name shadows the earlier one.
//!
//! The built-in set is closed ([`CapabilityModule`] variants). Hosts add their
//! own through [`CapabilityModule::Extension`].

pub mod console;
pub mod crypto;
pub mod filesystem;
pub mod host_rpc;
pub mod timers;

use std::fmt;
use std::sync::Arc;

use crate::config::ModuleSpec;
use crate::engine::{EngineError, InterruptHandle, ScriptContext, Value};
use crate::kernel::output::{CaptureSink, OutputCache};
use crate::ledger::{CoreHandle, QuotaError, Reservation};
use crate::link::{LinkError, VmLink};
use crate::types::{KernelId, ResourceKind};

use self::filesystem::FilesystemOptions;
use self::host_rpc::HostRpcOptions;
use self::timers::TimerOptions;

/// Host function callable from guest code.
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, BindingError> + Send + Sync>;

/// What a registry entry refers to.
#[derive(Clone)]
pub enum BindingKind {
    /// A host function.
    Function(HostFn),
    /// A constant value.
    Constant(Value),
    /// A function defined by guest code and published as an entry point.
    Export,
}

/// Named runtime value handle held by the registry.
#[derive(Clone)]
pub struct Binding {
    name: String,
    origin: String,
    kind: BindingKind,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BindingKind::Function(_) => "function",
            BindingKind::Constant(_) => "constant",
            BindingKind::Export => "export",
        };
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("kind", &kind)
            .finish()
    }
}

impl Binding {
    /// Host function binding.
    pub fn function<F>(origin: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, BindingError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            origin: origin.into(),
            kind: BindingKind::Function(Arc::new(f)),
        }
    }

    /// Constant value binding.
    pub fn constant(origin: impl Into<String>, name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            kind: BindingKind::Constant(value),
        }
    }

    /// Guest entry point binding.
    pub fn export(origin: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            kind: BindingKind::Export,
        }
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the module (or guest unit) that produced the binding.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Binding payload.
    pub fn kind(&self) -> &BindingKind {
        &self.kind
    }

    /// Whether the binding was produced by a host capability module.
    pub fn is_host(&self) -> bool {
        !matches!(self.kind, BindingKind::Export)
    }

    /// Invoke a host binding. Constants return their value when called without arguments.
    ///
    /// # Errors
    ///
    /// Returns whatever the host function reports, or
    /// [`BindingError::InvalidArgument`] for misuse of constants and exports.
    pub fn invoke(&self, args: &[Value]) -> Result<Value, BindingError> {
        match &self.kind {
            BindingKind::Function(f) => f(args),
            BindingKind::Constant(value) if args.is_empty() => Ok(value.clone()),
            BindingKind::Constant(_) => Err(BindingError::InvalidArgument(format!(
                "{} is a constant and takes no arguments",
                self.name
            ))),
            BindingKind::Export => Err(BindingError::InvalidArgument(format!(
                "{} is a guest function",
                self.name
            ))),
        }
    }
}

/// Failure reported by a host binding during a guest call.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    /// The guest passed unusable arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The capability refuses the operation.
    #[error("access denied: {0}")]
    Denied(String),
    /// A quota was exhausted.
    #[error(transparent)]
    Quota(#[from] QuotaError),
    /// The VM link failed.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Host I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The call observed an interrupt request.
    #[error("interrupted")]
    Interrupted,
}

/// Failure reported by a module while installing.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// A host resource the module depends on is absent.
    #[error("missing host resource: {0}")]
    MissingResource(String),
    /// The Core refused a reservation.
    #[error(transparent)]
    Quota(#[from] QuotaError),
    /// The module cannot work with the given configuration or environment.
    #[error("incompatible configuration: {0}")]
    Incompatible(String),
    /// The script context rejected an installation step.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Mutable handle a module receives while it installs.
pub struct InstallContext<'a> {
    kernel: KernelId,
    module: &'a str,
    context: &'a mut dyn ScriptContext,
    core: &'a Arc<dyn CoreHandle>,
    link: &'a Arc<dyn VmLink>,
    output: &'a Arc<OutputCache>,
    reservations: &'a mut Vec<Reservation>,
    runtime: Option<tokio::runtime::Handle>,
}

impl<'a> InstallContext<'a> {
    /// Assemble an install handle. Used by the kernel during construction.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kernel: KernelId,
        module: &'a str,
        context: &'a mut dyn ScriptContext,
        core: &'a Arc<dyn CoreHandle>,
        link: &'a Arc<dyn VmLink>,
        output: &'a Arc<OutputCache>,
        reservations: &'a mut Vec<Reservation>,
    ) -> Self {
        Self {
            kernel,
            module,
            context,
            core,
            link,
            output,
            reservations,
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    /// Kernel being built.
    pub fn kernel_id(&self) -> KernelId {
        self.kernel
    }

    /// Name of the module currently installing.
    pub fn module(&self) -> &str {
        self.module
    }

    /// The kernel's execution context.
    pub fn context(&mut self) -> &mut dyn ScriptContext {
        &mut *self.context
    }

    /// Reserve a resource with the Core. Released automatically when the
    /// kernel shuts down or its construction fails.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Quota`] if the Core refuses.
    pub fn reserve(&mut self, kind: ResourceKind, amount: u64) -> Result<(), InstallError> {
        let reservation = self.core.reserve(self.kernel, kind, amount)?;
        self.reservations.push(reservation);
        Ok(())
    }

    /// Shared handle to the VM link.
    pub fn link(&self) -> Arc<dyn VmLink> {
        Arc::clone(self.link)
    }

    /// Writer into the kernel's output cache.
    pub fn capture(&self) -> CaptureSink {
        CaptureSink::new(self.kernel, Arc::clone(self.output))
    }

    /// Interrupt flag of the kernel's context, for long-running bindings.
    pub fn interrupt(&self) -> InterruptHandle {
        self.context.interrupt_handle()
    }

    /// Async runtime active during construction, if any.
    pub fn runtime(&self) -> Option<tokio::runtime::Handle> {
        self.runtime.clone()
    }
}

/// Host-provided capability outside the built-in set.
pub trait Extension: Send + Sync {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Install into a kernel and return the bindings to register.
    ///
    /// # Errors
    ///
    /// Returns an [`InstallError`] to abort kernel construction.
    fn install(&self, ctx: &mut InstallContext<'_>) -> Result<Vec<Binding>, InstallError>;
}

/// One entry of a kernel's module list.
#[derive(Clone)]
pub enum CapabilityModule {
    /// Console-style output capture.
    Console,
    /// Hashing, randomness and encoding helpers.
    Crypto,
    /// Clock and bounded sleeping.
    Timers(TimerOptions),
    /// Scoped host directory access.
    Filesystem(FilesystemOptions),
    /// Requests forwarded over the VM link.
    HostRpc(HostRpcOptions),
    /// Host-provided module.
    Extension(Arc<dyn Extension>),
}

impl fmt::Debug for CapabilityModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityModule({})", self.name())
    }
}

impl CapabilityModule {
    /// Wrap a host extension.
    pub fn extension(ext: impl Extension + 'static) -> Self {
        Self::Extension(Arc::new(ext))
    }

    /// Module name used in errors and logs.
    pub fn name(&self) -> &str {
        match self {
            Self::Console => "console",
            Self::Crypto => "crypto",
            Self::Timers(_) => "timers",
            Self::Filesystem(_) => "filesystem",
            Self::HostRpc(_) => "host_rpc",
            Self::Extension(ext) => ext.name(),
        }
    }

    /// Install the module and return its bindings.
    ///
    /// # Errors
    ///
    /// Returns the module's [`InstallError`].
    pub fn install(&self, ctx: &mut InstallContext<'_>) -> Result<Vec<Binding>, InstallError> {
        match self {
            Self::Console => console::install(ctx),
            Self::Crypto => crypto::install(ctx),
            Self::Timers(opts) => timers::install(ctx, opts),
            Self::Filesystem(opts) => filesystem::install(ctx, opts),
            Self::HostRpc(opts) => host_rpc::install(ctx, opts),
            Self::Extension(ext) => ext.install(ctx),
        }
    }
}

impl From<ModuleSpec> for CapabilityModule {
    fn from(spec: ModuleSpec) -> Self {
        match spec {
            ModuleSpec::Console => Self::Console,
            ModuleSpec::Crypto => Self::Crypto,
            ModuleSpec::Timers(opts) => Self::Timers(opts),
            ModuleSpec::Filesystem(opts) => Self::Filesystem(opts),
            ModuleSpec::HostRpc(opts) => Self::HostRpc(opts),
        }
    }
}

/// Fetch a required string argument.
pub(crate) fn str_arg<'v>(args: &'v [Value], index: usize, what: &str) -> Result<&'v str, BindingError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| BindingError::InvalidArgument(format!("expected string {what} at position {index}")))
}

/// Fetch a required non-negative integer argument.
pub(crate) fn u64_arg(args: &[Value], index: usize, what: &str) -> Result<u64, BindingError> {
    args.get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| BindingError::InvalidArgument(format!("expected unsigned integer {what} at position {index}")))
}
