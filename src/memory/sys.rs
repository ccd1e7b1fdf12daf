//! Thin shim over the platform allocator with an installable OOM handler
//! chain.
//!
//! The shim is the floor of the subsystem: the small-object allocator routes
//! oversized requests here and grows its arena through here. On an OS
//! allocation failure the currently installed handler is invoked (it is
//! expected to release memory elsewhere) and the OS call retried, until the
//! call succeeds or no handler is installed, at which point the process
//! terminates with an "out of memory" diagnostic. There is no recoverable
//! error surface.

use crate::sync::{cell, unsafe_cell_get_mut, YieldFlag};
use std::ptr::NonNull;

/// User-installed callback invoked when the OS allocator returns failure.
/// Expected to free memory elsewhere (drain a cache, drop a buffer) before
/// the allocation is retried.
pub type OomHandler = fn();

/// Raw platform allocation entry points. Implemented over libc in normal
/// builds and over `std::alloc` (with a size header) under loom and Miri,
/// where FFI is unavailable.
trait HeapOps {
    unsafe fn raw_alloc(n: usize) -> *mut u8;
    unsafe fn raw_realloc(p: *mut u8, new_sz: usize) -> *mut u8;
    unsafe fn raw_free(p: *mut u8);
}

struct PlatformHeap;

#[cfg(not(any(loom, miri)))]
impl HeapOps for PlatformHeap {
    unsafe fn raw_alloc(n: usize) -> *mut u8 {
        // malloc(0) may legally return null; a zero-byte request still wants
        // a unique pointer.
        let n = n.max(1);
        // Safety: FFI call to malloc.
        unsafe { libc::malloc(n).cast::<u8>() }
    }

    unsafe fn raw_realloc(p: *mut u8, new_sz: usize) -> *mut u8 {
        let new_sz = new_sz.max(1);
        // Safety: FFI call to realloc; caller guarantees `p` is a live
        // allocation from this heap.
        unsafe { libc::realloc(p.cast::<libc::c_void>(), new_sz).cast::<u8>() }
    }

    unsafe fn raw_free(p: *mut u8) {
        // Safety: FFI call to free; caller guarantees `p` is a live
        // allocation from this heap.
        unsafe { libc::free(p.cast::<libc::c_void>()) }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: std-alloc-backed heap (no FFI)
//
// Each allocation carries a 16-byte header holding the total size so that
// `raw_free` and `raw_realloc` can reconstruct the layout. Sufficient for
// testing the retry/handler logic and the allocator layers above; the real
// malloc behaviour is exercised in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl HeapOps for PlatformHeap {
    unsafe fn raw_alloc(n: usize) -> *mut u8 {
        const HEADER: usize = 16;
        let total = n.max(1) + HEADER;
        let Ok(layout) = std::alloc::Layout::from_size_align(total, HEADER) else {
            return std::ptr::null_mut();
        };
        // Safety: layout has non-zero size.
        let base = unsafe { std::alloc::alloc(layout) };
        if base.is_null() {
            return base;
        }
        // Safety: base is valid for at least HEADER bytes.
        unsafe {
            base.cast::<usize>().write(total);
            base.add(HEADER)
        }
    }

    unsafe fn raw_realloc(p: *mut u8, new_sz: usize) -> *mut u8 {
        const HEADER: usize = 16;
        if p.is_null() {
            // Safety: fresh allocation.
            return unsafe { Self::raw_alloc(new_sz) };
        }
        // Safety: p was produced by raw_alloc, so the header is readable.
        let old_total = unsafe { p.sub(HEADER).cast::<usize>().read() };
        let old_payload = old_total - HEADER;
        // Safety: fresh allocation.
        let q = unsafe { Self::raw_alloc(new_sz) };
        if q.is_null() {
            return q;
        }
        // Safety: both regions are valid for the copied length.
        unsafe {
            std::ptr::copy_nonoverlapping(p, q, old_payload.min(new_sz.max(1)));
            Self::raw_free(p);
        }
        q
    }

    unsafe fn raw_free(p: *mut u8) {
        const HEADER: usize = 16;
        if p.is_null() {
            return;
        }
        // Safety: p was produced by raw_alloc.
        unsafe {
            let base = p.sub(HEADER);
            let total = base.cast::<usize>().read();
            let layout = std::alloc::Layout::from_size_align_unchecked(total, HEADER);
            std::alloc::dealloc(base, layout);
        }
    }
}

// ---------------------------------------------------------------------------
// Test-only failure injection
//
// A budget of forced failures consumed by the next OS calls, so the OOM
// handler loop can be exercised in-process without exhausting real memory.
// ---------------------------------------------------------------------------
#[cfg(any(test, loom))]
pub(crate) mod fail_injection {
    use crate::sync::atomic::{AtomicUsize, Ordering};

    crate::sync::static_atomic! {
        static FAIL_BUDGET: AtomicUsize = AtomicUsize::new(0);
    }

    /// Force the next `n` OS allocation attempts to fail.
    pub(crate) fn fail_next_allocations(n: usize) {
        FAIL_BUDGET.store(n, Ordering::SeqCst);
    }

    /// True when this attempt should fail (consumes one unit of budget).
    pub(crate) fn consume() -> bool {
        FAIL_BUDGET
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[inline]
unsafe fn os_alloc(n: usize) -> *mut u8 {
    #[cfg(any(test, loom))]
    if fail_injection::consume() {
        return std::ptr::null_mut();
    }
    // Safety: forwarded to the platform heap.
    unsafe { PlatformHeap::raw_alloc(n) }
}

#[inline]
unsafe fn os_realloc(p: *mut u8, new_sz: usize) -> *mut u8 {
    #[cfg(any(test, loom))]
    if fail_injection::consume() {
        return std::ptr::null_mut();
    }
    // Safety: forwarded to the platform heap.
    unsafe { PlatformHeap::raw_realloc(p, new_sz) }
}

// ---------------------------------------------------------------------------
// OOM handler chain
// ---------------------------------------------------------------------------

/// Handler storage, guarded by a yield flag so installation never races a
/// read: a reader always observes either the old or the new function, never
/// a torn state.
struct HandlerSlot {
    flag: YieldFlag,
    handler: cell::UnsafeCell<Option<OomHandler>>,
}

// Safety: the cell is only accessed while `flag` is held.
unsafe impl Sync for HandlerSlot {}

impl HandlerSlot {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            flag: YieldFlag::new(),
            handler: cell::UnsafeCell::new(None),
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            flag: YieldFlag::new(),
            handler: cell::UnsafeCell::new(None),
        }
    }
}

crate::sync::static_atomic! {
    static OOM_HANDLER: HandlerSlot = HandlerSlot::new();
}

/// Install a new OOM handler (or clear it with `None`) and return the
/// previously installed one. Initially no handler is installed, in which
/// case the first unrecoverable allocation failure terminates the process.
pub fn set_oom_handler(f: Option<OomHandler>) -> Option<OomHandler> {
    let _guard = OOM_HANDLER.flag.acquire();
    let slot = unsafe_cell_get_mut!(OOM_HANDLER.handler);
    std::mem::replace(slot, f)
}

fn current_oom_handler() -> Option<OomHandler> {
    let _guard = OOM_HANDLER.flag.acquire();
    *unsafe_cell_get_mut!(OOM_HANDLER.handler)
}

fn oom_fatal() -> ! {
    eprintln!("out of memory");
    std::process::exit(1);
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Request `n` bytes from the OS allocator, engaging the OOM handler chain
/// on failure. Never returns null; terminates the process if the OS cannot
/// satisfy the request and no handler is installed.
pub(crate) fn allocate(n: usize) -> NonNull<u8> {
    // Safety: plain allocation request.
    let p = unsafe { os_alloc(n) };
    match NonNull::new(p) {
        Some(p) => p,
        None => oom_alloc(n),
    }
}

/// Single OS attempt with no handler fallback. Returns `None` on failure.
/// The arena growth path uses this to distinguish "try" from "must".
pub(crate) fn try_allocate(n: usize) -> Option<NonNull<u8>> {
    // Safety: plain allocation request.
    NonNull::new(unsafe { os_alloc(n) })
}

/// Resize `p` to `new_sz` bytes, preserving contents up to the smaller of
/// the two sizes (platform realloc semantics). Engages the OOM handler
/// chain on failure.
///
/// # Safety
/// - `p` must be a live allocation obtained from this shim.
/// - `p` is invalidated by this call; only the returned pointer may be used.
#[allow(dead_code)]
pub(crate) unsafe fn reallocate(p: NonNull<u8>, new_sz: usize) -> NonNull<u8> {
    // Safety: caller guarantees `p` is live and from this heap.
    let q = unsafe { os_realloc(p.as_ptr(), new_sz) };
    match NonNull::new(q) {
        Some(q) => q,
        None => oom_realloc(p, new_sz),
    }
}

/// Release `p` unconditionally. Never fails.
///
/// # Safety
/// - `p` must be a live allocation obtained from this shim.
/// - `p` must not be used after this call.
pub(crate) unsafe fn deallocate(p: NonNull<u8>) {
    // Safety: caller guarantees `p` is live and from this heap.
    unsafe { PlatformHeap::raw_free(p.as_ptr()) }
}

/// Retry loop after a failed allocation: invoke the installed handler, then
/// retry the OS call. Repeats until success. Fatal when no handler is
/// installed at the time of a retry.
fn oom_alloc(n: usize) -> NonNull<u8> {
    loop {
        let Some(handler) = current_oom_handler() else {
            oom_fatal();
        };
        handler();
        // Safety: plain allocation request.
        if let Some(p) = NonNull::new(unsafe { os_alloc(n) }) {
            return p;
        }
    }
}

#[allow(dead_code)]
fn oom_realloc(p: NonNull<u8>, new_sz: usize) -> NonNull<u8> {
    loop {
        let Some(handler) = current_oom_handler() else {
            oom_fatal();
        };
        handler();
        // Safety: `p` is still live; every failed realloc leaves the
        // original allocation intact.
        if let Some(q) = NonNull::new(unsafe { os_realloc(p.as_ptr(), new_sz) }) {
            return q;
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_allocate_roundtrip() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = allocate(64);
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0xA5, 64);
            assert_eq!(p.as_ptr().read(), 0xA5);
            assert_eq!(p.as_ptr().add(63).read(), 0xA5);
            deallocate(p);
        }
    }

    #[test]
    fn test_allocate_zero_bytes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Zero-byte requests still produce a unique, freeable pointer.
        let p = allocate(0);
        let q = allocate(0);
        assert_ne!(p, q);
        // Safety: Test code.
        unsafe {
            deallocate(p);
            deallocate(q);
        }
    }

    #[test]
    fn test_reallocate_preserves_contents() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = allocate(16);
        // Safety: Test code.
        unsafe {
            for i in 0..16 {
                p.as_ptr().add(i).write(i as u8);
            }
            let q = reallocate(p, 256);
            for i in 0..16 {
                assert_eq!(q.as_ptr().add(i).read(), i as u8);
            }
            deallocate(q);
        }
    }

    #[test]
    fn test_set_oom_handler_returns_previous() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        fn h1() {}
        fn h2() {}

        let initial = set_oom_handler(Some(h1));
        let prev = set_oom_handler(Some(h2));
        assert_eq!(prev, Some(h1 as OomHandler));
        let prev = set_oom_handler(initial);
        assert_eq!(prev, Some(h2 as OomHandler));
    }

    static HANDLER_HITS: AtomicUsize = AtomicUsize::new(0);

    fn counting_handler() {
        HANDLER_HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_oom_handler_loop_retries_until_success() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        HANDLER_HITS.store(0, Ordering::SeqCst);
        let prev = set_oom_handler(Some(counting_handler));

        // Two forced failures: first attempt fails, handler runs, retry
        // fails, handler runs again, second retry succeeds.
        fail_injection::fail_next_allocations(2);
        let p = allocate(32);
        assert_eq!(HANDLER_HITS.load(Ordering::SeqCst), 2);
        // Safety: Test code.
        unsafe {
            p.as_ptr().write(1);
            deallocate(p);
        }

        set_oom_handler(prev);
    }

    #[test]
    fn test_oom_handler_loop_on_realloc() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        HANDLER_HITS.store(0, Ordering::SeqCst);
        let prev = set_oom_handler(Some(counting_handler));

        let p = allocate(8);
        // Safety: Test code.
        unsafe {
            p.as_ptr().write(0x5A);
        }
        fail_injection::fail_next_allocations(1);
        // Safety: Test code.
        let q = unsafe { reallocate(p, 128) };
        assert!(HANDLER_HITS.load(Ordering::SeqCst) >= 1);
        // Safety: Test code.
        unsafe {
            assert_eq!(q.as_ptr().read(), 0x5A);
            deallocate(q);
        }

        set_oom_handler(prev);
    }
}
