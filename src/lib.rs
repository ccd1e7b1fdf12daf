pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator tiers
pub use memory::small::{
    GlobalSmallAlloc, SmallAlloc, SmallAllocConfig, ALIGN, MAX_BYTES, NFREELISTS,
};
pub use memory::sys::{set_oom_handler, OomHandler};

// buffer pools
pub use memory::buffer_pool::BufferPool;

// mgmt/stats
pub use memory::manager::{MemoryManager, MemoryStats};

// errors
pub use memory::InitError;
