//! Kernel lifecycle state shared between callers, shutdown and health checks.

use serde::Serialize;
use tokio::sync::watch;

use super::KernelError;

/// Observable lifecycle state of a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KernelState {
    /// Accepting calls.
    Ready,
    /// Shutdown requested; the in-flight call may finish, new calls are refused.
    Draining,
    /// An engine anomaly occurred; every call fails fast.
    Poisoned {
        /// What poisoned the kernel.
        reason: String,
    },
    /// Shut down; the context is released.
    Retired,
}

impl KernelState {
    /// Short label for logs and link notifications.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Poisoned { .. } => "poisoned",
            Self::Retired => "retired",
        }
    }

    /// Whether the state is [`KernelState::Poisoned`].
    pub fn is_poisoned(&self) -> bool {
        matches!(self, Self::Poisoned { .. })
    }
}

/// Watch-backed state holder so shutdown can wait for poisoning.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    tx: watch::Sender<KernelState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(KernelState::Ready);
        Self { tx }
    }

    pub(crate) fn get(&self) -> KernelState {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<KernelState> {
        self.tx.subscribe()
    }

    /// Fail fast unless the kernel is ready.
    pub(crate) fn check_accepting(&self) -> Result<(), KernelError> {
        match &*self.tx.borrow() {
            KernelState::Ready => Ok(()),
            KernelState::Draining => Err(KernelError::ShuttingDown),
            KernelState::Poisoned { reason } => Err(KernelError::Poisoned {
                reason: reason.clone(),
            }),
            KernelState::Retired => Err(KernelError::Retired),
        }
    }

    /// Record poisoning. Returns `false` if the kernel was already poisoned or retired.
    pub(crate) fn poison(&self, reason: &str) -> bool {
        self.tx.send_if_modified(|state| match state {
            KernelState::Ready | KernelState::Draining => {
                *state = KernelState::Poisoned {
                    reason: reason.to_owned(),
                };
                true
            }
            KernelState::Poisoned { .. } | KernelState::Retired => false,
        })
    }

    /// Start shutdown. Returns whether the kernel was poisoned at that moment.
    pub(crate) fn begin_drain(&self) -> Result<bool, KernelError> {
        let mut outcome = Ok(false);
        self.tx.send_if_modified(|state| match state {
            KernelState::Ready => {
                *state = KernelState::Draining;
                true
            }
            KernelState::Poisoned { .. } => {
                outcome = Ok(true);
                false
            }
            KernelState::Draining => {
                outcome = Err(KernelError::ShuttingDown);
                false
            }
            KernelState::Retired => {
                outcome = Err(KernelError::Retired);
                false
            }
        });
        outcome
    }

    pub(crate) fn retire(&self) {
        self.tx.send_replace(KernelState::Retired);
    }
}

/// Resolve once `rx` observes a poisoned state.
pub(crate) async fn until_poisoned(mut rx: watch::Receiver<KernelState>) {
    let _ = rx.wait_for(KernelState::is_poisoned).await;
}
