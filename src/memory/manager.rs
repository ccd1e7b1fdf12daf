use super::buffer_pool;
use super::stats;

/// Snapshot of the diagnostic gauges. Values are eventually consistent;
/// see [`stats`](super::stats).
pub struct MemoryStats {
    /// Cumulative bytes the small-object arena has acquired from the OS.
    pub heap_acquired: usize,
    /// Bytes currently live through the large-request bypass.
    pub large_live: usize,
    /// Buffers parked in pool caches across all element types.
    pub pool_cached_buffers: usize,
    /// Buffers issued by pools and not yet released.
    pub pool_live_buffers: usize,
}

/// Central entry point for subsystem-wide maintenance.
pub struct MemoryManager;

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Drain every registered buffer pool cache, returning the parked
    /// buffers to the small-object allocator. Call when a workload phase
    /// ends and its buffer shapes will not repeat.
    pub fn trim() {
        buffer_pool::drain_all_pools();
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            heap_acquired: stats::HEAP_ACQUIRED.get(),
            large_live: stats::LARGE_LIVE.get(),
            pool_cached_buffers: stats::POOL_CACHED_BUFFERS.get(),
            pool_live_buffers: stats::POOL_LIVE_BUFFERS.get(),
        }
    }
}
