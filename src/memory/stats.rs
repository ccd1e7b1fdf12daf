//! Diagnostic gauges for the memory subsystem.
//!
//! All counters use `Relaxed` ordering and are eventually consistent; a
//! snapshot across several counters may be transiently contradictory. Fine
//! for display, useless for decisions: nothing in the allocation paths may
//! read these.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge.
///
/// Under contention a subtract can land before the matching add, so the raw
/// value may transiently dip below zero. `get()` clamps negatives to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Clamp rather than panic: these are gauges, not ledgers.
        std::cmp::min(val, isize::MAX as usize) as isize
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0) as usize
    }
}

// Cumulative bytes the small-object arena has acquired from the OS.
// Grows monotonically; nothing is ever returned before process exit.
crate::sync::static_atomic! {
    pub static HEAP_ACQUIRED: Counter = Counter::new();
}

// Bytes currently live through the large-request bypass (> MAX_BYTES).
crate::sync::static_atomic! {
    pub static LARGE_LIVE: Counter = Counter::new();
}

// Buffers currently parked in pool caches, across all element types.
crate::sync::static_atomic! {
    pub static POOL_CACHED_BUFFERS: Counter = Counter::new();
}

// Buffers issued by pools and not yet released, across all element types.
crate::sync::static_atomic! {
    pub static POOL_LIVE_BUFFERS: Counter = Counter::new();
}
