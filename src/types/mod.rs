//! Identifiers and small value types shared across the kernel.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity of one sandbox kernel instance.
///
/// Assigned once at construction and never changed. Used to correlate log
/// events, captured output, the VM database entry and link messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelId(Uuid);

impl KernelId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (used when rehydrating from storage).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID value.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for KernelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "krn-{}", self.0)
    }
}

/// Which output stream a captured record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Regular diagnostics (stdout equivalent).
    Stdout,
    /// Error diagnostics (stderr equivalent).
    Stderr,
}

impl StreamKind {
    /// Short label used in rendered output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Kind of host resource a capability module can reserve with the Core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Bytes of scoped filesystem storage.
    StorageBytes,
    /// Concurrent timer facilities.
    TimerSlots,
    /// Outbound request channels over the VM link.
    RpcSlots,
}

impl ResourceKind {
    /// Stable label for logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StorageBytes => "storage_bytes",
            Self::TimerSlots => "timer_slots",
            Self::RpcSlots => "rpc_slots",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
