//! Resource accounting on behalf of the owning Core.
//!
//! Capability modules reserve host resources while they are installed into a
//! kernel. The [`ResourceLedger`] enforces global limits per
//! [`ResourceKind`] using lock-free atomics and remembers every outstanding
//! [`Reservation`] so a kernel's teardown can be checked to be
//! resource-neutral.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QuotaConfig;
use crate::types::{KernelId, ResourceKind};

/// Errors produced by quota accounting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    /// The requested amount would push usage past the configured limit.
    #[error("{kind} quota exceeded: requested {requested}, available {available}")]
    Exceeded {
        /// Resource being reserved.
        kind: ResourceKind,
        /// Amount requested.
        requested: u64,
        /// Amount still available under the limit.
        available: u64,
    },
    /// A release referred to a reservation the ledger does not know.
    #[error("unknown reservation {0}")]
    UnknownReservation(Uuid),
}

/// A granted claim on some amount of a host resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Unique reservation identifier.
    pub id: Uuid,
    /// Kernel the reservation was made for.
    pub kernel: KernelId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Reserved amount.
    pub amount: u64,
}

/// The Core's resource accounting surface, as seen by kernels and modules.
pub trait CoreHandle: Send + Sync {
    /// Reserve `amount` of `kind` for `kernel`.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exceeded`] when the limit would be breached.
    fn reserve(
        &self,
        kernel: KernelId,
        kind: ResourceKind,
        amount: u64,
    ) -> Result<Reservation, QuotaError>;

    /// Return a reservation to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::UnknownReservation`] if it was already released.
    fn release(&self, reservation: &Reservation) -> Result<(), QuotaError>;

    /// Total amount of `kind` currently held by `kernel`.
    fn held_by(&self, kernel: KernelId, kind: ResourceKind) -> u64;
}

/// Per-kind usage counter with a fixed limit.
#[derive(Debug)]
struct Pool {
    used: AtomicU64,
    limit: u64,
}

impl Pool {
    fn new(limit: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
        }
    }

    /// Claim `amount` if it fits. Compare-exchange keeps concurrent claims exact.
    fn try_claim(&self, kind: ResourceKind, amount: u64) -> Result<(), QuotaError> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(amount);
            if next > self.limit {
                return Err(QuotaError::Exceeded {
                    kind,
                    requested: amount,
                    available: self.limit.saturating_sub(current),
                });
            }
            match self
                .used
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn give_back(&self, amount: u64) {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(amount);
            match self
                .used
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// In-memory [`CoreHandle`] with global per-kind limits.
#[derive(Debug)]
pub struct ResourceLedger {
    storage: Pool,
    timers: Pool,
    rpc: Pool,
    outstanding: Mutex<HashMap<Uuid, Reservation>>,
}

impl ResourceLedger {
    /// Create a ledger with limits taken from the quota configuration.
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            storage: Pool::new(config.storage_bytes),
            timers: Pool::new(config.timer_slots),
            rpc: Pool::new(config.rpc_slots),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    fn pool(&self, kind: ResourceKind) -> &Pool {
        match kind {
            ResourceKind::StorageBytes => &self.storage,
            ResourceKind::TimerSlots => &self.timers,
            ResourceKind::RpcSlots => &self.rpc,
        }
    }

    /// Global usage of `kind` across all kernels.
    pub fn used(&self, kind: ResourceKind) -> u64 {
        self.pool(kind).used.load(Ordering::Relaxed)
    }

    /// Configured limit for `kind`.
    pub fn limit(&self, kind: ResourceKind) -> u64 {
        self.pool(kind).limit
    }

    /// Number of reservations not yet released.
    pub fn outstanding(&self) -> usize {
        match self.outstanding.lock() {
            Ok(map) => map.len(),
            Err(e) => {
                warn!(error = %e, "ledger lock poisoned in outstanding");
                0
            }
        }
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new(&QuotaConfig::default())
    }
}

impl CoreHandle for ResourceLedger {
    fn reserve(
        &self,
        kernel: KernelId,
        kind: ResourceKind,
        amount: u64,
    ) -> Result<Reservation, QuotaError> {
        self.pool(kind).try_claim(kind, amount)?;
        let reservation = Reservation {
            id: Uuid::new_v4(),
            kernel,
            kind,
            amount,
        };
        match self.outstanding.lock() {
            Ok(mut map) => {
                map.insert(reservation.id, reservation.clone());
            }
            Err(e) => {
                self.pool(kind).give_back(amount);
                warn!(error = %e, "ledger lock poisoned in reserve");
                return Err(QuotaError::Exceeded {
                    kind,
                    requested: amount,
                    available: 0,
                });
            }
        }
        debug!(%kernel, %kind, amount, reservation = %reservation.id, "resource reserved");
        Ok(reservation)
    }

    fn release(&self, reservation: &Reservation) -> Result<(), QuotaError> {
        let removed = match self.outstanding.lock() {
            Ok(mut map) => map.remove(&reservation.id),
            Err(e) => {
                warn!(error = %e, "ledger lock poisoned in release");
                None
            }
        };
        let Some(found) = removed else {
            return Err(QuotaError::UnknownReservation(reservation.id));
        };
        self.pool(found.kind).give_back(found.amount);
        debug!(
            kernel = %found.kernel,
            kind = %found.kind,
            amount = found.amount,
            "resource released"
        );
        Ok(())
    }

    fn held_by(&self, kernel: KernelId, kind: ResourceKind) -> u64 {
        match self.outstanding.lock() {
            Ok(map) => map
                .values()
                .filter(|r| r.kernel == kernel && r.kind == kind)
                .fold(0u64, |acc, r| acc.saturating_add(r.amount)),
            Err(e) => {
                warn!(error = %e, "ledger lock poisoned in held_by");
                0
            }
        }
    }
}
