//! The sandbox kernel aggregate.
//!
//! A [`SandboxKernel`] owns one script context and serializes every use of
//! it behind a fair async mutex (the execution guard). Calls run on the
//! blocking pool while holding an owned guard, so the guard is released on
//! every exit path including panics inside the engine. Callers that time out
//! or cancel trigger the context's interrupt flag and wait a bounded grace
//! period; an evaluation that does not unwind in that window poisons the
//! kernel instead of being forcibly stopped.

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lifecycle::{until_poisoned, KernelState, Lifecycle};
use super::output::{OutputCache, OutputRecord};
use super::registry::{ImportCache, Registry};
use super::KernelError;
use crate::capabilities::{Binding, BindingError, BindingKind, CapabilityModule, InstallContext};
use crate::engine::{
    EngineError, GuestEnv, InterruptHandle, ScriptContext, ScriptEngine, ScriptError, SourceUnit,
    StepEngine, Value, MAX_CALL_DEPTH,
};
use crate::ledger::{CoreHandle, Reservation};
use crate::link::VmLink;
use crate::types::KernelId;
use crate::vmdb::VmDbEntry;

/// Construction parameters for a [`SandboxKernel`].
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Capability modules, installed in order. Later bindings shadow earlier ones.
    pub modules: Vec<CapabilityModule>,
    /// Output cache capacity in records.
    pub output_capacity: usize,
    /// Default deadline for calls that do not set their own. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// How long an interrupted call may take to unwind before the kernel is poisoned.
    pub cancel_grace: Duration,
    /// Nesting limit for guest function calls.
    pub max_call_depth: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            output_capacity: 512,
            call_timeout: None,
            cancel_grace: Duration::from_secs(2),
            max_call_depth: 64,
        }
    }
}

impl KernelConfig {
    /// Append a module to the install order.
    pub fn with_module(mut self, module: CapabilityModule) -> Self {
        self.modules.push(module);
        self
    }

    /// Set the default call deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set the unwind grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline covering both the wait for the guard and the execution.
    /// Falls back to [`KernelConfig::call_timeout`].
    pub timeout: Option<Duration>,
    /// Caller-side cancellation.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Set the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Result of a successful evaluation or call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Completion value.
    pub value: Value,
    /// Wall time spent executing, excluding the wait for the guard.
    pub elapsed: Duration,
    /// Output sequence numbers captured while this call held the guard.
    pub output: Range<u64>,
}

/// Point-in-time health report.
#[derive(Debug, Clone, Serialize)]
pub struct KernelHealth {
    /// Kernel identifier.
    pub id: KernelId,
    /// Lifecycle state.
    pub state: KernelState,
    /// Registered names, host and guest.
    pub bindings: usize,
    /// Records currently in the output cache.
    pub output_records: usize,
    /// Records lost to overflow.
    pub output_evicted: u64,
    /// Outstanding Core reservations.
    pub reservations: usize,
    /// Whether the VM link is up.
    pub link_connected: bool,
}

impl KernelHealth {
    /// Ready and connected.
    pub fn is_healthy(&self) -> bool {
        self.state == KernelState::Ready && self.link_connected
    }
}

/// State only touched while holding the execution guard.
struct Guarded {
    context: Option<Box<dyn ScriptContext>>,
    imports: ImportCache,
}

enum Invocation {
    Evaluate(SourceUnit),
    Call { entry: String, args: Vec<Value> },
}

impl Invocation {
    fn label(&self) -> &str {
        match self {
            Self::Evaluate(unit) => &unit.name,
            Self::Call { entry, .. } => entry,
        }
    }
}

type Outcome = std::thread::Result<Result<Value, ScriptError>>;

/// [`GuestEnv`] over the kernel's registry and import cache.
struct KernelEnv<'a> {
    imports: &'a mut ImportCache,
    registry: &'a RwLock<Registry>,
    origin: &'a str,
}

impl GuestEnv for KernelEnv<'_> {
    fn import(&mut self, specifier: &str) -> Result<Binding, ScriptError> {
        let registry = self.registry;
        self.imports.resolve_with(specifier, |name| {
            read_registry(registry)
                .resolve(name)
                .ok_or_else(|| ScriptError::thrown(format!("cannot resolve import `{name}`")))
        })
    }

    fn export(&mut self, name: &str) -> Result<(), ScriptError> {
        write_registry(self.registry)
            .register_export(name, self.origin)
            .map_err(|e| ScriptError::thrown(e.to_string()))?;
        debug!(export = name, origin = self.origin, "guest entry point registered");
        Ok(())
    }
}

/// One isolated script execution context with its capabilities.
pub struct SandboxKernel {
    id: KernelId,
    engine: String,
    modules: Vec<String>,
    guarded: Arc<tokio::sync::Mutex<Guarded>>,
    interrupt: InterruptHandle,
    registry: Arc<RwLock<Registry>>,
    output: Arc<OutputCache>,
    core: Arc<dyn CoreHandle>,
    link: Arc<dyn VmLink>,
    reservations: Mutex<Vec<Reservation>>,
    lifecycle: Lifecycle,
    call_timeout: Option<Duration>,
    cancel_grace: Duration,
    db_entry: Option<Arc<VmDbEntry>>,
}

impl fmt::Debug for SandboxKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxKernel")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("modules", &self.modules)
            .field("state", &self.lifecycle.get())
            .field("vm", &self.link.vm_id())
            .finish_non_exhaustive()
    }
}

impl SandboxKernel {
    /// Build a kernel on the built-in step engine.
    ///
    /// # Errors
    ///
    /// See [`SandboxKernel::with_engine`].
    pub fn new(
        config: KernelConfig,
        core: Arc<dyn CoreHandle>,
        link: Arc<dyn VmLink>,
    ) -> Result<Self, KernelError> {
        let engine = StepEngine::new(config.max_call_depth);
        Self::with_engine(config, &engine, core, link)
    }

    /// Build a kernel: create the context, install every module in order,
    /// then seal the registry.
    ///
    /// Construction is all-or-nothing. If any module fails, the context is
    /// disposed and every reservation made so far is released before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidConfig`], [`KernelError::ContextCreation`]
    /// or [`KernelError::ModuleInstall`].
    pub fn with_engine(
        config: KernelConfig,
        engine: &dyn ScriptEngine,
        core: Arc<dyn CoreHandle>,
        link: Arc<dyn VmLink>,
    ) -> Result<Self, KernelError> {
        if config.output_capacity == 0 {
            return Err(KernelError::InvalidConfig(
                "output capacity must be at least one record".to_owned(),
            ));
        }
        if config.max_call_depth == 0 || config.max_call_depth > MAX_CALL_DEPTH {
            return Err(KernelError::InvalidConfig(format!(
                "max call depth must be between 1 and {MAX_CALL_DEPTH}, got {}",
                config.max_call_depth
            )));
        }

        let id = KernelId::new();
        let mut context = engine
            .create_context(id)
            .map_err(KernelError::ContextCreation)?;
        let output = Arc::new(OutputCache::new(config.output_capacity));
        let mut registry = Registry::new();
        let mut reservations = Vec::new();

        for module in &config.modules {
            let installed = {
                let mut ctx = InstallContext::new(
                    id,
                    module.name(),
                    context.as_mut(),
                    &core,
                    &link,
                    &output,
                    &mut reservations,
                );
                module.install(&mut ctx)
            };
            let bindings = match installed {
                Ok(bindings) => bindings,
                Err(source) => {
                    warn!(kernel = %id, module = module.name(), error = %source, "module install failed, tearing down");
                    context.dispose();
                    release_all(core.as_ref(), &mut reservations);
                    return Err(KernelError::ModuleInstall {
                        module: module.name().to_owned(),
                        source,
                    });
                }
            };
            for binding in bindings {
                let name = binding.name().to_owned();
                match registry.install(binding) {
                    Ok(Some(shadowed)) => debug!(
                        kernel = %id,
                        binding = %name,
                        module = module.name(),
                        shadowed = shadowed.origin(),
                        "binding shadowed"
                    ),
                    Ok(None) => {}
                    Err(e) => {
                        context.dispose();
                        release_all(core.as_ref(), &mut reservations);
                        return Err(e.into());
                    }
                }
            }
        }
        registry.seal();

        let interrupt = context.interrupt_handle();
        info!(
            kernel = %id,
            engine = engine.name(),
            modules = config.modules.len(),
            bindings = registry.len(),
            vm = link.vm_id(),
            "sandbox kernel ready"
        );

        Ok(Self {
            id,
            engine: engine.name().to_owned(),
            modules: config.modules.iter().map(|m| m.name().to_owned()).collect(),
            guarded: Arc::new(tokio::sync::Mutex::new(Guarded {
                context: Some(context),
                imports: ImportCache::new(),
            })),
            interrupt,
            registry: Arc::new(RwLock::new(registry)),
            output,
            core,
            link,
            reservations: Mutex::new(reservations),
            lifecycle: Lifecycle::new(),
            call_timeout: config.call_timeout,
            cancel_grace: config.cancel_grace,
            db_entry: None,
        })
    }

    /// Attach the VM database record this kernel serves.
    pub fn with_db_entry(mut self, entry: Arc<VmDbEntry>) -> Self {
        self.db_entry = Some(entry);
        self
    }

    /// Kernel identifier.
    pub fn id(&self) -> KernelId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> KernelState {
        self.lifecycle.get()
    }

    /// Whether an engine anomaly has poisoned this kernel.
    pub fn is_poisoned(&self) -> bool {
        self.lifecycle.get().is_poisoned()
    }

    /// Installed module names in install order.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// VM database record, if attached.
    pub fn db_entry(&self) -> Option<&Arc<VmDbEntry>> {
        self.db_entry.as_ref()
    }

    /// The link to the outer VM process.
    pub fn link(&self) -> &Arc<dyn VmLink> {
        &self.link
    }

    /// Evaluate a source unit with default options.
    ///
    /// # Errors
    ///
    /// See [`SandboxKernel::run_with`].
    pub async fn run(&self, unit: SourceUnit) -> Result<ExecutionResult, KernelError> {
        self.run_with(unit, CallOptions::default()).await
    }

    /// Evaluate a source unit. Calls are serialized; concurrent callers wait
    /// their turn in arrival order.
    ///
    /// # Errors
    ///
    /// Guest exceptions surface as [`KernelError::GuestFault`] and leave the
    /// kernel usable. Engine failures poison it.
    pub async fn run_with(
        &self,
        unit: SourceUnit,
        opts: CallOptions,
    ) -> Result<ExecutionResult, KernelError> {
        self.execute(Invocation::Evaluate(unit), opts).await
    }

    /// Invoke a guest entry point exported by an earlier evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NotFound`] unless `entry` names a guest export,
    /// otherwise as [`SandboxKernel::run_with`].
    pub async fn call(
        &self,
        entry: &str,
        args: Vec<Value>,
        opts: CallOptions,
    ) -> Result<ExecutionResult, KernelError> {
        match self.resolve(entry) {
            Some(binding) if matches!(binding.kind(), BindingKind::Export) => {}
            _ => return Err(KernelError::NotFound(entry.to_owned())),
        }
        self.execute(
            Invocation::Call {
                entry: entry.to_owned(),
                args,
            },
            opts,
        )
        .await
    }

    /// Look up a registered binding by exact name.
    ///
    /// Reads the registry without taking the execution guard.
    pub fn resolve(&self, name: &str) -> Option<Binding> {
        read_registry(&self.registry).resolve(name)
    }

    /// Resolve an import specifier through the context's import cache.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NotFound`] for unknown specifiers, or the
    /// lifecycle error if the kernel no longer accepts work.
    pub async fn resolve_import(&self, specifier: &str) -> Result<Binding, KernelError> {
        self.lifecycle.check_accepting()?;
        let mut guard = self.guarded.lock().await;
        self.lifecycle.check_accepting()?;
        let registry = &self.registry;
        guard.imports.resolve_with(specifier, |name| {
            read_registry(registry)
                .resolve(name)
                .ok_or_else(|| KernelError::NotFound(name.to_owned()))
        })
    }

    /// Replace a host binding on a live kernel. Takes the execution guard and
    /// drops the stale import cache entry.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Registry`] for guest bindings, or the
    /// lifecycle error if the kernel no longer accepts work.
    pub async fn rebind(&self, binding: Binding) -> Result<Option<Binding>, KernelError> {
        self.lifecycle.check_accepting()?;
        let mut guard = self.guarded.lock().await;
        self.lifecycle.check_accepting()?;
        let name = binding.name().to_owned();
        let previous = write_registry(&self.registry).rebind(binding)?;
        guard.imports.invalidate(&name);
        info!(kernel = %self.id, binding = %name, "host binding re-registered");
        Ok(previous)
    }

    /// Registered names in sorted order.
    pub fn binding_names(&self) -> Vec<String> {
        read_registry(&self.registry).names()
    }

    /// Copy of the captured output.
    pub fn output_snapshot(&self) -> Vec<OutputRecord> {
        self.output.snapshot()
    }

    /// Take the captured output, leaving the cache empty.
    pub fn drain_output(&self) -> Vec<OutputRecord> {
        self.output.drain()
    }

    /// Health report.
    pub fn health(&self) -> KernelHealth {
        KernelHealth {
            id: self.id,
            state: self.lifecycle.get(),
            bindings: read_registry(&self.registry).len(),
            output_records: self.output.len(),
            output_evicted: self.output.evicted(),
            reservations: self.held_reservations().len(),
            link_connected: self.link.is_connected(),
        }
    }

    /// Shut the kernel down and return the output captured since the last drain.
    ///
    /// The in-flight call, if any, is allowed to finish and calls that have
    /// not started yet are refused. A poisoned kernel is waited on for at
    /// most the cancel grace period; after that the context is abandoned to
    /// the stuck call and released when it finally returns.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ShuttingDown`] or [`KernelError::Retired`] if
    /// shutdown already started.
    pub async fn shutdown(&self) -> Result<Vec<OutputRecord>, KernelError> {
        let was_poisoned = self.lifecycle.begin_drain()?;
        info!(kernel = %self.id, poisoned = was_poisoned, "sandbox kernel shutting down");

        let guard = if was_poisoned {
            self.acquire_within_grace().await
        } else {
            tokio::select! {
                guard = Arc::clone(&self.guarded).lock_owned() => Some(guard),
                () = until_poisoned(self.lifecycle.subscribe()) => self.acquire_within_grace().await,
            }
        };

        match guard {
            Some(mut guard) => {
                if let Some(mut context) = guard.context.take() {
                    context.dispose();
                }
                guard.imports.clear();
            }
            None => {
                warn!(kernel = %self.id, grace = ?self.cancel_grace, "abandoning context held by an unresponsive call");
            }
        }

        release_all(self.core.as_ref(), &mut self.held_reservations());
        self.lifecycle.retire();
        let drained = self.output.drain();
        info!(kernel = %self.id, records = drained.len(), "sandbox kernel retired");
        Ok(drained)
    }

    async fn acquire_within_grace(&self) -> Option<tokio::sync::OwnedMutexGuard<Guarded>> {
        tokio::time::timeout(self.cancel_grace, Arc::clone(&self.guarded).lock_owned())
            .await
            .ok()
    }

    async fn execute(
        &self,
        invocation: Invocation,
        opts: CallOptions,
    ) -> Result<ExecutionResult, KernelError> {
        self.lifecycle.check_accepting()?;
        let cancel = opts.cancel.unwrap_or_default();
        let timeout = opts.timeout.or(self.call_timeout);
        let deadline = timeout.and_then(|t| tokio::time::Instant::now().checked_add(t));
        let timed_out = || KernelError::Timeout(timeout.unwrap_or_default());

        let guard = tokio::select! {
            guard = Arc::clone(&self.guarded).lock_owned() => guard,
            () = cancel.cancelled() => return Err(KernelError::Cancelled),
            () = deadline_elapsed(deadline) => return Err(timed_out()),
        };
        // Shutdown or poisoning may have happened while queued.
        self.lifecycle.check_accepting()?;

        let token = self.interrupt.begin();
        let label = invocation.label().to_owned();
        let started = Instant::now();
        let first_seq = self.output.next_seq();
        let registry = Arc::clone(&self.registry);

        let mut task = tokio::task::spawn_blocking(move || -> Outcome {
            let mut guard = guard;
            let state = &mut *guard;
            let outcome = match state.context.as_mut() {
                None => Ok(Err(ScriptError::Engine(EngineError::Disposed))),
                Some(context) => {
                    let mut env = KernelEnv {
                        imports: &mut state.imports,
                        registry: &registry,
                        origin: invocation.label(),
                    };
                    panic::catch_unwind(AssertUnwindSafe(|| match &invocation {
                        Invocation::Evaluate(unit) => context.evaluate(unit, &mut env),
                        Invocation::Call { entry, args } => context.call(entry, args, &mut env),
                    }))
                }
            };
            drop(guard);
            outcome
        });

        let (joined, interrupted_by) = tokio::select! {
            joined = &mut task => (Some(joined), None),
            () = cancel.cancelled() => (None, Some(KernelError::Cancelled)),
            () = deadline_elapsed(deadline) => (None, Some(timed_out())),
        };
        let joined = match joined {
            Some(joined) => joined,
            None => {
                debug!(kernel = %self.id, call = %label, "interrupting guest call");
                self.interrupt.trigger_for(token);
                match tokio::time::timeout(self.cancel_grace, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        self.poison(&format!("`{label}` did not unwind after interruption"));
                        return Err(KernelError::Unresponsive {
                            grace: self.cancel_grace,
                        });
                    }
                }
            }
        };

        let result = self.settle(joined, interrupted_by);
        let elapsed = started.elapsed();
        match result {
            Ok(value) => {
                debug!(kernel = %self.id, call = %label, elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX), "guest call completed");
                Ok(ExecutionResult {
                    value,
                    elapsed,
                    output: first_seq..self.output.next_seq(),
                })
            }
            Err(e) => {
                debug!(kernel = %self.id, call = %label, error = %e, "guest call failed");
                Err(e)
            }
        }
    }

    fn settle(
        &self,
        joined: Result<Outcome, JoinError>,
        interrupted_by: Option<KernelError>,
    ) -> Result<Value, KernelError> {
        match joined {
            Err(join) => Err(self.anomaly(format!("execution task failed: {join}"))),
            Ok(Err(payload)) => Err(self.anomaly(format!(
                "engine panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(self.classify(err, interrupted_by)),
        }
    }

    fn classify(&self, err: ScriptError, interrupted_by: Option<KernelError>) -> KernelError {
        match err {
            ScriptError::Thrown { message } => KernelError::GuestFault { message },
            ScriptError::Interrupted => interrupted_by.unwrap_or(KernelError::Cancelled),
            ScriptError::Binding { binding, source } => match source {
                BindingError::Link(source) => KernelError::Link { binding, source },
                BindingError::Quota(quota) => KernelError::Quota(quota),
                BindingError::Interrupted => interrupted_by.unwrap_or(KernelError::Cancelled),
                other => KernelError::GuestFault {
                    message: format!("{binding}: {other}"),
                },
            },
            ScriptError::Engine(e) => self.anomaly(e.to_string()),
        }
    }

    fn anomaly(&self, reason: String) -> KernelError {
        self.poison(&reason);
        KernelError::EngineAnomaly { reason }
    }

    fn poison(&self, reason: &str) {
        if self.lifecycle.poison(reason) {
            error!(kernel = %self.id, reason, "kernel poisoned");
        }
    }

    fn held_reservations(&self) -> std::sync::MutexGuard<'_, Vec<Reservation>> {
        self.reservations.lock().unwrap_or_else(|poisoned| {
            warn!(kernel = %self.id, "reservation list lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for SandboxKernel {
    fn drop(&mut self) {
        let mut held = self.held_reservations();
        if !held.is_empty() {
            warn!(kernel = %self.id, count = held.len(), "kernel dropped without shutdown, releasing reservations");
            release_all(self.core.as_ref(), &mut held);
        }
    }
}

fn release_all(core: &dyn CoreHandle, reservations: &mut Vec<Reservation>) {
    for reservation in reservations.drain(..) {
        if let Err(e) = core.release(&reservation) {
            warn!(reservation = %reservation.id, error = %e, "failed to release reservation");
        }
    }
}

fn read_registry(lock: &RwLock<Registry>) -> RwLockReadGuard<'_, Registry> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("binding registry lock poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write_registry(lock: &RwLock<Registry>) -> RwLockWriteGuard<'_, Registry> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("binding registry lock poisoned, recovering");
        poisoned.into_inner()
    })
}

async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
