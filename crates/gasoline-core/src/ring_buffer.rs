//! Bounded telemetry buffer with dual (count + memory) eviction.
//!
//! Each entry carries its payload and the instant it was inserted, stored
//! together so payloads and timestamps can never drift out of step. When an
//! append pushes the buffer past its count cap or its byte budget, the oldest
//! entries are dropped first.
//!
//! # Use cases in Gasoline
//!
//! - **Network bodies**: count cap plus an 8 MiB budget.
//! - **WebSocket events**: count cap plus a 4 MiB budget.
//! - **User actions** and **extension logs**: count cap only.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

/// Estimated heap footprint of a buffered item.
///
/// Estimates must be stable for a given value: the running total subtracts
/// the same number on eviction that it added on insert.
pub trait MemoryEstimate {
    fn estimated_bytes(&self) -> u64;
}

// =============================================================================
// Entry
// =============================================================================

/// A buffered payload and its insertion time.
#[derive(Debug, Clone)]
pub struct Entry<T> {
    payload: T,
    inserted_at: Instant,
}

impl<T> Entry<T> {
    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    #[must_use]
    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }
}

// =============================================================================
// RingBuffer
// =============================================================================

/// A count- and memory-bounded FIFO buffer.
///
/// Iteration yields items from oldest to newest.
///
/// # Example
///
/// ```ignore
/// let mut rb = RingBuffer::new(2, None);
/// rb.add(vec![a, b, c], Instant::now()); // a evicted
/// assert_eq!(rb.len(), 2);
/// assert_eq!(rb.total_added(), 3);
/// ```
pub struct RingBuffer<T> {
    entries: VecDeque<Entry<T>>,
    max_count: usize,
    memory_limit: Option<u64>,
    memory_total: u64,
    total_added: u64,
    total_evicted: u64,
}

impl<T: MemoryEstimate> RingBuffer<T> {
    /// Create a buffer holding at most `max_count` entries and, if given,
    /// at most `memory_limit` estimated bytes.
    ///
    /// # Panics
    ///
    /// Panics if `max_count` is 0.
    #[must_use]
    pub fn new(max_count: usize, memory_limit: Option<u64>) -> Self {
        assert!(max_count > 0, "max_count must be > 0");
        Self {
            entries: VecDeque::with_capacity(max_count.min(1024)),
            max_count,
            memory_limit,
            memory_total: 0,
            total_added: 0,
            total_evicted: 0,
        }
    }

    /// Append a batch, stamping every item with `now`, then enforce the count
    /// cap followed by the memory cap. Returns the number of entries evicted.
    pub fn add<I>(&mut self, items: I, now: Instant) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        for payload in items {
            self.memory_total += payload.estimated_bytes();
            self.entries.push_back(Entry {
                payload,
                inserted_at: now,
            });
            self.total_added += 1;
        }
        self.evict_by_count() + self.evict_for_memory()
    }

    fn evict_by_count(&mut self) -> usize {
        if self.entries.len() <= self.max_count {
            return 0;
        }
        let drop = self.entries.len() - self.max_count;
        self.drop_front(drop)
    }

    /// Single pass: find how many leading entries cover the excess, then
    /// remove them in one drain.
    fn evict_for_memory(&mut self) -> usize {
        let Some(limit) = self.memory_limit else {
            return 0;
        };
        if self.memory_total <= limit {
            return 0;
        }
        let mut excess = self.memory_total - limit;
        let mut drop = 0;
        for entry in &self.entries {
            if excess == 0 {
                break;
            }
            excess = excess.saturating_sub(entry.payload.estimated_bytes());
            drop += 1;
        }
        self.drop_front(drop)
    }

    fn drop_front(&mut self, n: usize) -> usize {
        let n = n.min(self.entries.len());
        if n == 0 {
            return 0;
        }
        let freed: u64 = self
            .entries
            .drain(..n)
            .map(|e| e.payload.estimated_bytes())
            .sum();
        self.memory_total = self.memory_total.saturating_sub(freed);
        self.total_evicted += n as u64;
        n
    }

    /// Drop the `n` oldest entries (memory-pressure eviction).
    pub fn evict_oldest(&mut self, n: usize) -> usize {
        self.drop_front(n)
    }

    /// Drop everything. Counters keep their history.
    pub fn clear(&mut self) {
        let n = self.entries.len();
        self.drop_front(n);
        self.memory_total = 0;
    }

    /// Change the count cap, evicting immediately if the buffer is now over it.
    ///
    /// # Panics
    ///
    /// Panics if `max_count` is 0.
    pub fn set_max_count(&mut self, max_count: usize) -> usize {
        assert!(max_count > 0, "max_count must be > 0");
        self.max_count = max_count;
        self.evict_by_count()
    }

    /// Brute-force sum of per-entry estimates.
    #[must_use]
    pub fn recompute_memory(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.payload.estimated_bytes())
            .sum()
    }
}

impl<T> RingBuffer<T> {
    /// Iterate payloads from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter().map(|e| &e.payload)
    }

    /// Iterate entries (payload + insertion time) from oldest to newest.
    pub fn iter_entries(&self) -> impl DoubleEndedIterator<Item = &Entry<T>> + ExactSizeIterator {
        self.entries.iter()
    }

    /// Insertion instants, oldest first.
    #[must_use]
    pub fn inserted_at(&self) -> Vec<Instant> {
        self.entries.iter().map(|e| e.inserted_at).collect()
    }

    /// Current number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    #[must_use]
    pub fn memory_limit(&self) -> Option<u64> {
        self.memory_limit
    }

    /// Running estimate of retained bytes.
    #[must_use]
    pub fn memory_total(&self) -> u64 {
        self.memory_total
    }

    /// Items ever added. Never decreases.
    #[must_use]
    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    /// Items ever evicted, for any reason.
    #[must_use]
    pub fn total_evicted(&self) -> u64 {
        self.total_evicted
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> RingBufferStats {
        RingBufferStats {
            max_count: self.max_count,
            len: self.entries.len(),
            total_added: self.total_added,
            total_evicted: self.total_evicted,
            memory_bytes: self.memory_total,
            memory_limit: self.memory_limit,
        }
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Owned copy of every payload, oldest first.
    #[must_use]
    pub fn get_all(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("max_count", &self.max_count)
            .field("len", &self.entries.len())
            .field("memory_total", &self.memory_total)
            .field("total_added", &self.total_added)
            .finish()
    }
}

// =============================================================================
// RingBufferStats (serializable)
// =============================================================================

/// Serializable statistics about a ring buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingBufferStats {
    pub max_count: usize,
    pub len: usize,
    pub total_added: u64,
    pub total_evicted: u64,
    pub memory_bytes: u64,
    pub memory_limit: Option<u64>,
}

// =============================================================================
// Tests
// =============================================================================
