//! Kernel error taxonomy.

use std::time::Duration;

use crate::capabilities::InstallError;
use crate::engine::EngineError;
use crate::ledger::QuotaError;
use crate::link::LinkError;

use super::registry::RegistryError;

/// Errors surfaced by [`SandboxKernel`](super::SandboxKernel) operations.
///
/// Construction and poison errors are terminal for the instance and must
/// reach the Core so it can replace the kernel. Guest faults, link failures,
/// quota errors, cancellations and timeouts belong to one call only.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The kernel configuration is unusable.
    #[error("invalid kernel configuration: {0}")]
    InvalidConfig(String),

    /// A capability module failed to install; no kernel was created.
    #[error("module `{module}` failed to install: {source}")]
    ModuleInstall {
        /// Name of the failing module.
        module: String,
        /// Module-reported cause.
        #[source]
        source: InstallError,
    },

    /// The engine could not create the execution context.
    #[error("script context could not be created: {0}")]
    ContextCreation(#[source] EngineError),

    /// Guest code threw, or misused a binding. The kernel stays usable.
    #[error("guest fault: {message}")]
    GuestFault {
        /// Exception or binding message.
        message: String,
    },

    /// The engine failed internally during this call; the kernel is now poisoned.
    #[error("engine anomaly, kernel poisoned: {reason}")]
    EngineAnomaly {
        /// What went wrong.
        reason: String,
    },

    /// An interrupted call did not unwind in time; the kernel is now poisoned.
    #[error("call did not unwind within {grace:?} of interruption; kernel poisoned")]
    Unresponsive {
        /// Grace period that elapsed.
        grace: Duration,
    },

    /// The kernel was poisoned by an earlier call and refuses all work.
    #[error("kernel poisoned: {reason}")]
    Poisoned {
        /// Reason recorded when the kernel was poisoned.
        reason: String,
    },

    /// The VM link failed while serving a binding.
    #[error("vm link failure in `{binding}`: {source}")]
    Link {
        /// Binding that used the link.
        binding: String,
        /// Link failure.
        #[source]
        source: LinkError,
    },

    /// A capability quota was exhausted.
    #[error("quota exceeded: {0}")]
    Quota(#[from] QuotaError),

    /// The caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,

    /// The call's deadline passed; the engine unwound cleanly.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// No guest entry point or binding is registered under the name.
    #[error("`{0}` is not registered")]
    NotFound(String),

    /// A registry update was refused.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Shutdown has begun; no new calls are accepted.
    #[error("kernel is shutting down")]
    ShuttingDown,

    /// The kernel has been shut down.
    #[error("kernel has been retired")]
    Retired,
}

impl KernelError {
    /// Whether the instance is unusable after this error and must be replaced.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::ModuleInstall { .. }
                | Self::ContextCreation(_)
                | Self::EngineAnomaly { .. }
                | Self::Unresponsive { .. }
                | Self::Poisoned { .. }
                | Self::Retired
        )
    }

    /// Whether the error was raised by guest code.
    pub fn is_guest_fault(&self) -> bool {
        matches!(self, Self::GuestFault { .. })
    }
}
