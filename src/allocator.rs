//! Facade: process-wide tier instances and the public sized API.
//!
//! All mutable state lives in statics: the central cache behind its own
//! per-class spinlocks, the page cache behind one mutex, and one thread
//! cache per thread. Nothing is torn down; the OS reclaims at exit.
//!
//! The crate itself allocates bookkeeping (page-cache maps) through the
//! system allocator, so it must not be installed as the process-wide
//! global allocator.

use crate::central_cache::CentralCache;
use crate::page_cache::PageCache;
use crate::span::FreeBlock;
use crate::thread_cache::{oversized_alloc, oversized_free, ThreadCache};
use crate::size_class;
use crate::MAX_POOLED;
use core::ptr;
use std::cell::UnsafeCell;
use std::sync::Mutex;

static CENTRAL_CACHE: CentralCache = CentralCache::new();
static PAGE_CACHE: Mutex<PageCache> = Mutex::new(PageCache::new());

thread_local! {
    static THREAD_CACHE: UnsafeCell<ThreadCache> = UnsafeCell::new(ThreadCache::new());
}

/// Try to access the thread-local cache. Returns None if TLS is not
/// available (thread startup/shutdown).
#[inline]
fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    THREAD_CACHE
        .try_with(|cell| {
            // SAFETY: the cell is only ever touched from this thread, and
            // nothing in the tiers re-enters the thread cache.
            unsafe { f(&mut *cell.get()) }
        })
        .ok()
}

/// Acquire a block of `size` bytes, aligned to [`crate::ALIGNMENT`].
///
/// Returns null iff `size == 0` or the OS and all tiers failed. Requests
/// above [`MAX_POOLED`] are served by the OS allocator.
pub fn allocate(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    if let Some(ptr) =
        with_thread_cache(|tc| unsafe { tc.allocate(size, &CENTRAL_CACHE, &PAGE_CACHE) })
    {
        return ptr;
    }
    allocate_direct(size)
}

/// Release a block previously returned by [`allocate`].
///
/// Null pointers and zero sizes are no-ops.
///
/// # Safety
///
/// `ptr` must come from `allocate(size)` with this exact `size`, and must
/// not be used after this call. A mismatched size is undefined behavior.
pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
    if ptr.is_null() || size == 0 {
        return;
    }
    if with_thread_cache(|tc| unsafe { tc.deallocate(ptr, size, &CENTRAL_CACHE, &PAGE_CACHE) })
        .is_some()
    {
        return;
    }
    unsafe { deallocate_direct(ptr, size) };
}

/// TLS unavailable: serve a single block straight from the central cache.
#[cold]
fn allocate_direct(size: usize) -> *mut u8 {
    if size > MAX_POOLED {
        return unsafe { oversized_alloc(size) };
    }
    let class = size_class::class_of(size);
    let (count, head) = CENTRAL_CACHE.fetch_limited(class, 1, &PAGE_CACHE);
    if count == 0 {
        return ptr::null_mut();
    }
    head as *mut u8
}

/// TLS unavailable: hand a single block straight back to the central cache.
#[cold]
unsafe fn deallocate_direct(ptr: *mut u8, size: usize) {
    if size > MAX_POOLED {
        unsafe { oversized_free(ptr, size) };
        return;
    }
    let class = size_class::class_of(size);
    let block = ptr as *mut FreeBlock;
    unsafe {
        (*block).next = ptr::null_mut();
        CENTRAL_CACHE.receive_from_thread_cache(block, 1, class, &PAGE_CACHE);
    }
}

/// Total bytes the page cache has ever mapped from the OS. Monotonic;
/// useful for leak bounds in stress tests.
pub fn mapped_bytes() -> usize {
    PAGE_CACHE
        .lock()
        .map(|pc| pc.mapped_bytes())
        .unwrap_or(usize::MAX)
}

/// Number of spans currently sitting on the page cache's free buckets.
/// Grows when a central-cache drain hands fully-free spans back.
pub fn free_span_count() -> usize {
    PAGE_CACHE
        .lock()
        .map(|pc| pc.free_span_count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ALIGNMENT;

    #[test]
    fn test_allocate_zero_is_null() {
        assert!(allocate(0).is_null());
    }

    #[test]
    fn test_deallocate_null_is_noop() {
        unsafe { deallocate(ptr::null_mut(), 64) };
    }

    #[test]
    fn test_allocate_is_aligned() {
        for size in [1, 7, 8, 9, 100, 4096, MAX_POOLED] {
            let p = allocate(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGNMENT, 0);
            unsafe { deallocate(p, size) };
        }
    }

    #[test]
    fn test_direct_paths_round_trip() {
        // The direct paths are what the facade falls back to without TLS;
        // exercise them explicitly.
        let p = allocate_direct(128);
        assert!(!p.is_null());
        unsafe {
            p.write_bytes(0xA5, 128);
            deallocate_direct(p, 128);
        }

        let big = allocate_direct(MAX_POOLED + 1);
        assert!(!big.is_null());
        unsafe { deallocate_direct(big, MAX_POOLED + 1) };
    }
}
