//! Typed buffer pools over the small-object allocator.
//!
//! A pool caches whole released buffers keyed by their element count: a
//! buffer returned after serving 12 elements is only ever reissued for a
//! request of exactly 12. Lookup stays O(1) and no partitioning is needed;
//! the fragmentation cost is accepted because the target workloads request
//! the same shapes over and over.
//!
//! One process-wide pool exists per element type, reachable through
//! [`BufferPool::instance`]. Elements are default-constructed when a buffer
//! is first allocated; a reused buffer keeps whatever payload its previous
//! user left behind. Dropping happens at release time only.

use super::small::{GlobalSmallAlloc, ALIGN};
use super::stats;
use crate::sync::{Mutex, OnceLock};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::ptr::NonNull;

struct PoolState<T> {
    /// Element count for every buffer issued and not yet released. An entry
    /// lives from first allocation to final release.
    issued: HashMap<usize, usize>,
    /// Released buffers awaiting reuse, keyed by element count. Reuse is
    /// LIFO so the most recently touched buffer goes out first.
    cached: HashMap<usize, Vec<NonNull<T>>>,
}

/// A cache of fixed-shape buffers for one element type. See the module
/// documentation for the reuse policy.
pub struct BufferPool<T> {
    state: Mutex<PoolState<T>>,
}

// Safety: the pool owns its cached buffers outright and the bookkeeping is
// behind the mutex; `T: Send` lets buffers migrate with their pool.
unsafe impl<T: Send> Send for BufferPool<T> {}
// Safety: all interior state is guarded by the mutex.
unsafe impl<T: Send> Sync for BufferPool<T> {}

impl<T> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BufferPool<T> {
    /// Create a standalone pool. Most callers want the per-type singleton
    /// from [`instance`](Self::instance) instead.
    ///
    /// # Panics
    ///
    /// Panics for zero-sized element types and for types whose alignment
    /// exceeds the allocator's [`ALIGN`] guarantee.
    pub fn new() -> Self {
        assert!(
            std::mem::size_of::<T>() > 0,
            "BufferPool does not support zero-sized element types"
        );
        assert!(
            std::mem::align_of::<T>() <= ALIGN,
            "element alignment {} exceeds the allocator guarantee of {ALIGN}",
            std::mem::align_of::<T>()
        );
        Self {
            state: Mutex::new(PoolState {
                issued: HashMap::new(),
                cached: HashMap::new(),
            }),
        }
    }

    /// Acquire a buffer of `num` elements.
    ///
    /// A cached buffer of exactly `num` elements is reissued as-is, stale
    /// payload included. Otherwise `num * size_of::<T>()` bytes come from
    /// the global small-object allocator and every element is
    /// default-constructed.
    pub fn get_buffer(&self, num: usize) -> NonNull<T>
    where
        T: Default,
    {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(stack) = state.cached.get_mut(&num) {
            if let Some(buf) = stack.pop() {
                if stack.is_empty() {
                    state.cached.remove(&num);
                }
                stats::POOL_CACHED_BUFFERS.sub(1);
                return buf;
            }
        }

        let bytes = num
            .checked_mul(std::mem::size_of::<T>())
            .expect("buffer byte size overflows usize");
        let buf = GlobalSmallAlloc::allocate(bytes).cast::<T>();
        // Fresh memory: construct every element. Reused buffers skip this.
        // Safety: the allocation holds num elements and is exclusively ours.
        unsafe {
            for i in 0..num {
                buf.as_ptr().add(i).write(T::default());
            }
        }
        state.issued.insert(buf.as_ptr() as usize, num);
        stats::POOL_LIVE_BUFFERS.add(1);
        buf
    }

    /// Park a buffer in the cache for future [`get_buffer`](Self::get_buffer)
    /// calls of the same element count. No elements are dropped.
    ///
    /// Null is a no-op. A pointer this pool never issued is reported on
    /// stderr and ignored; the caller still owns it.
    ///
    /// # Safety
    /// - If `buffer` was issued by this pool, the caller transfers
    ///   ownership: the buffer must not be touched after this call.
    /// - Pointers the pool never issued are diagnosed and ignored (the
    ///   pointer is only compared, never dereferenced); ownership stays
    ///   with the caller.
    pub unsafe fn return_buffer(&self, buffer: *mut T) {
        if buffer.is_null() {
            return;
        }
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(&num) = state.issued.get(&(buffer as usize)) else {
            eprintln!("returned buffer {buffer:p} was not issued by this pool");
            return;
        };
        // Safety: issued buffers are never null.
        let buf = unsafe { NonNull::new_unchecked(buffer) };
        state.cached.entry(num).or_default().push(buf);
        stats::POOL_CACHED_BUFFERS.add(1);
    }

    /// Drop the `num` elements at `buffer` and hand the memory back to the
    /// allocator. Null is a no-op.
    ///
    /// # Safety
    /// - A non-null `buffer` must have come from `get_buffer(num)` on this
    ///   pool, with the same `num`, and must not be parked in the cache.
    /// - The buffer must hold `num` live elements.
    /// - The buffer must not be used after this call.
    pub unsafe fn release_buffer(&self, buffer: *mut T, num: usize) {
        if buffer.is_null() {
            return;
        }
        // Safety: caller guarantees num live elements.
        unsafe {
            for i in 0..num {
                std::ptr::drop_in_place(buffer.add(i));
            }
        }
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.issued.remove(&(buffer as usize)).is_some() {
                stats::POOL_LIVE_BUFFERS.sub(1);
            }
        }
        let bytes = num * std::mem::size_of::<T>();
        // Safety: the buffer was obtained from the global allocator with
        // exactly this byte size.
        unsafe { GlobalSmallAlloc::deallocate(NonNull::new_unchecked(buffer.cast::<u8>()), bytes) };
    }

    /// Drain the cache: every parked buffer has its elements dropped and its
    /// memory returned to the allocator. Buffers currently held by clients
    /// are unaffected.
    pub fn release_buffers(&self) {
        // Bookkeeping is mutated under one lock acquisition; destruction and
        // deallocation run after the lock is released.
        let drained: Vec<(usize, Vec<NonNull<T>>)> = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let cached = std::mem::take(&mut state.cached);
            for stack in cached.values() {
                for buf in stack {
                    if state.issued.remove(&(buf.as_ptr() as usize)).is_some() {
                        stats::POOL_LIVE_BUFFERS.sub(1);
                    }
                }
                stats::POOL_CACHED_BUFFERS.sub(stack.len());
            }
            cached.into_iter().collect()
        };

        for (num, stack) in drained {
            for buf in stack {
                // Safety: cached buffers hold num constructed elements and
                // are owned by the pool alone.
                unsafe {
                    for i in 0..num {
                        std::ptr::drop_in_place(buf.as_ptr().add(i));
                    }
                    GlobalSmallAlloc::deallocate(
                        buf.cast::<u8>(),
                        num * std::mem::size_of::<T>(),
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_count(&self) -> usize {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.cached.values().map(Vec::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn issued_count(&self) -> usize {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.issued.len()
    }
}

impl<T> Drop for BufferPool<T> {
    fn drop(&mut self) {
        self.release_buffers();
    }
}

// ---------------------------------------------------------------------------
// Per-type singletons
// ---------------------------------------------------------------------------

/// Registry-facing view of a pool: enough to drain its cache without
/// knowing the element type.
trait PoolEntry: Any + Send + Sync {
    fn drain(&self);
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

impl<T: Send + 'static> PoolEntry for BufferPool<T> {
    fn drain(&self) {
        self.release_buffers();
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

static POOL_REGISTRY: OnceLock<Mutex<HashMap<TypeId, &'static dyn PoolEntry>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<TypeId, &'static dyn PoolEntry>> {
    POOL_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl<T: Send + 'static> BufferPool<T> {
    /// The process-wide pool for `T`, created on first use and never torn
    /// down. Every call returns the same instance.
    pub fn instance() -> &'static BufferPool<T> {
        let entry: &'static dyn PoolEntry = {
            let mut map = registry()
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *map.entry(TypeId::of::<T>()).or_insert_with(|| {
                let pool: &'static BufferPool<T> = Box::leak(Box::new(BufferPool::<T>::new()));
                pool
            })
        };
        entry
            .as_any()
            .downcast_ref::<BufferPool<T>>()
            .expect("registry entry type matches its key")
    }
}

/// Drain the cache of every pool the registry knows about.
pub(crate) fn drain_all_pools() {
    let Some(reg) = POOL_REGISTRY.get() else {
        return;
    };
    let entries: Vec<&'static dyn PoolEntry> = reg
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .values()
        .copied()
        .collect();
    for entry in entries {
        entry.drain();
    }
}
