//! Script engine seam.
//!
//! The kernel never interprets guest code itself. It owns exactly one
//! [`ScriptContext`] produced by a [`ScriptEngine`] and drives it through
//! this trait surface. Capabilities reach the guest only through the
//! [`GuestEnv`] the kernel passes into every evaluation.

pub mod step;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::capabilities::{Binding, BindingError};
use crate::types::KernelId;

pub use step::StepEngine;

/// Runtime value exchanged between guest code and host bindings.
pub type Value = serde_json::Value;

/// One unit of guest source code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Name used in diagnostics (usually a file name).
    pub name: String,
    /// Source text in the engine's language.
    pub code: String,
}

impl SourceUnit {
    /// Create a unit from in-memory source.
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
        }
    }

    /// Read a unit from disk, naming it after the file.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be read.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let code = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("guest")
            .to_owned();
        Ok(Self { name, code })
    }
}

/// Deepest guest call nesting any engine context accepts.
///
/// Evaluation recurses on the blocking thread's stack, and overflowing it
/// aborts the process rather than unwinding.
pub const MAX_CALL_DEPTH: u32 = 128;

/// Shared flag an engine polls at its safe checkpoints.
///
/// Setting it asks the running evaluation to unwind with
/// [`ScriptError::Interrupted`]. Each call opens a new generation with
/// [`InterruptHandle::begin`]; the low bit of the state is the flag and the
/// rest counts generations, so a trigger aimed at a finished call cannot
/// reach the next one.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicU64>);

/// Generation returned by [`InterruptHandle::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptToken(u64);

impl InterruptHandle {
    /// Create a cleared handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new call: clear the flag and move to the next generation.
    pub fn begin(&self) -> InterruptToken {
        let next = |state: u64| (state | 1).wrapping_add(1);
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| Some(next(s)))
            .unwrap_or_else(|s| s);
        InterruptToken(next(previous))
    }

    /// Interrupt the call that opened `token`. Returns false when a later
    /// call has started since.
    pub fn trigger_for(&self, token: InterruptToken) -> bool {
        match self
            .0
            .compare_exchange(token.0, token.0 | 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == token.0 | 1,
        }
    }

    /// Interrupt whatever call is running now.
    pub fn trigger(&self) {
        self.0.fetch_or(1, Ordering::SeqCst);
    }

    /// Whether interruption has been requested.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst) & 1 == 1
    }
}

/// Failures inside the engine itself, never caused by well-formed guest code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine could not create a context.
    #[error("context creation failed: {0}")]
    Create(String),
    /// Internal engine state is inconsistent.
    #[error("engine state corrupted: {0}")]
    Internal(String),
    /// The context was used after disposal.
    #[error("context already disposed")]
    Disposed,
}

/// Outcome of a failed evaluation or call.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// Guest code raised an exception that nothing caught.
    #[error("uncaught guest exception: {message}")]
    Thrown {
        /// Exception message as rendered by the engine.
        message: String,
    },
    /// The evaluation observed an interrupt request and unwound.
    #[error("execution interrupted")]
    Interrupted,
    /// A host binding returned an error into guest code.
    #[error("binding `{binding}` failed: {source}")]
    Binding {
        /// Binding that failed.
        binding: String,
        /// Host-side failure.
        #[source]
        source: BindingError,
    },
    /// The engine itself failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ScriptError {
    /// Convenience constructor for guest exceptions.
    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown {
            message: message.into(),
        }
    }
}

/// The capability surface an evaluation may touch.
///
/// Implemented by the kernel over its registry and import cache.
pub trait GuestEnv {
    /// Resolve an import specifier to a binding.
    ///
    /// # Errors
    ///
    /// Returns a guest exception if nothing is registered under the name.
    fn import(&mut self, specifier: &str) -> Result<Binding, ScriptError>;

    /// Publish a guest-defined function as a callable entry point.
    ///
    /// # Errors
    ///
    /// Returns a guest exception if the name is taken by a host binding.
    fn export(&mut self, name: &str) -> Result<(), ScriptError>;
}

/// One isolated, non-reentrant execution context.
pub trait ScriptContext: Send {
    /// Install a constant global visible to all guest code.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the context is unusable.
    fn define_global(&mut self, name: &str, value: Value) -> Result<(), EngineError>;

    /// Evaluate a source unit and return its completion value.
    ///
    /// # Errors
    ///
    /// See [`ScriptError`].
    fn evaluate(&mut self, unit: &SourceUnit, env: &mut dyn GuestEnv)
        -> Result<Value, ScriptError>;

    /// Invoke a guest function previously exported by [`evaluate`](Self::evaluate).
    ///
    /// # Errors
    ///
    /// See [`ScriptError`].
    fn call(
        &mut self,
        entry: &str,
        args: &[Value],
        env: &mut dyn GuestEnv,
    ) -> Result<Value, ScriptError>;

    /// Handle the kernel uses to interrupt a running evaluation.
    fn interrupt_handle(&self) -> InterruptHandle;

    /// Release engine resources. The context must not be used afterwards.
    fn dispose(&mut self);
}

/// Factory for execution contexts.
pub trait ScriptEngine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &str;

    /// Create a fresh context owned by `kernel`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Create`] if the engine cannot allocate a context.
    fn create_context(&self, kernel: KernelId) -> Result<Box<dyn ScriptContext>, EngineError>;
}
