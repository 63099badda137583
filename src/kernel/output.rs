//! Bounded capture buffer for guest output.
//!
//! The cache holds at most `capacity` records. Appending to a full cache
//! evicts the oldest record first; overflow is silent, bounded data loss and
//! never an error. Evictions are counted so callers can tell history was lost.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{KernelId, StreamKind};

/// One captured line of guest output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Monotonic sequence number within one cache.
    pub seq: u64,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Stream the guest wrote to.
    pub stream: StreamKind,
    /// Text written.
    pub text: String,
}

#[derive(Debug)]
struct Ring {
    records: VecDeque<OutputRecord>,
    next_seq: u64,
    evicted: u64,
}

/// Fixed-capacity, order-preserving output buffer.
#[derive(Debug)]
pub struct OutputCache {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl OutputCache {
    /// Create an empty cache. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring {
                records: VecDeque::with_capacity(capacity),
                next_seq: 0,
                evicted: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        // A panic while holding the lock cannot leave the ring half-updated
        // (every mutation is a single push/pop), so recover the data.
        self.ring.lock().unwrap_or_else(|poisoned| {
            warn!("output cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Append a record, evicting the oldest one if the cache is full.
    pub fn append(&self, stream: StreamKind, text: impl Into<String>) -> u64 {
        let mut ring = self.lock();
        while ring.records.len() >= self.capacity {
            ring.records.pop_front();
            ring.evicted = ring.evicted.saturating_add(1);
        }
        let seq = ring.next_seq;
        ring.next_seq = seq.saturating_add(1);
        ring.records.push_back(OutputRecord {
            seq,
            timestamp: Utc::now(),
            stream,
            text: text.into(),
        });
        seq
    }

    /// Take every record, leaving the cache empty.
    pub fn drain(&self) -> Vec<OutputRecord> {
        let mut ring = self.lock();
        ring.records.drain(..).collect()
    }

    /// Copy every record without removing them.
    pub fn snapshot(&self) -> Vec<OutputRecord> {
        self.lock().records.iter().cloned().collect()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number the next appended record will receive.
    pub fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }

    /// Records dropped by overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }
}

/// Writer handle given to capability modules.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    kernel: KernelId,
    cache: Arc<OutputCache>,
}

impl CaptureSink {
    /// Create a sink appending into `cache` on behalf of `kernel`.
    pub fn new(kernel: KernelId, cache: Arc<OutputCache>) -> Self {
        Self { kernel, cache }
    }

    /// Capture one line of guest output.
    pub fn write(&self, stream: StreamKind, text: impl Into<String>) {
        let seq = self.cache.append(stream, text);
        tracing::trace!(kernel = %self.kernel, seq, stream = stream.as_str(), "guest output captured");
    }
}
