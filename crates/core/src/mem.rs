//! Allocation accounting for region data
//!
//! Every mutation of a region's Default/Write CF content reports a signed
//! delta to a shared [`MemoryAccountant`], so the process-wide aggregate
//! stays exactly reconciled with the sum of all regions' `data_size()`.
//! The accountant is injected into each `RegionData` at construction; it is
//! a handle, not a global.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Cheaply cloneable handle over a process-wide allocation counter.
///
/// Move-assignment and snapshot swaps must report one signed reconcile
/// instead of an independent alloc+free pair, so the counter can never
/// double-count a transferred region.
#[derive(Debug, Clone, Default)]
pub struct MemoryAccountant {
    in_use: Arc<AtomicI64>,
}

impl MemoryAccountant {
    /// Create a new accountant with a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` bytes allocated.
    pub fn allocate(&self, n: u64) {
        self.in_use.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// Record `n` bytes freed.
    pub fn free(&self, n: u64) {
        self.in_use.fetch_sub(n as i64, Ordering::Relaxed);
    }

    /// Record an ownership transfer from a footprint of `prev` bytes to
    /// `current` bytes as a single signed delta.
    pub fn reconcile(&self, prev: u64, current: u64) {
        if current >= prev {
            self.allocate(current - prev);
        } else {
            self.free(prev - current);
        }
    }

    /// Current accounted footprint in bytes.
    pub fn in_use(&self) -> i64 {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Zero the counter. Test hook.
    pub fn reset(&self) {
        self.in_use.store(0, Ordering::Relaxed);
    }
}
