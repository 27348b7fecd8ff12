//! Thread cache (front-end): per-thread free lists for lock-free allocation.
//!
//! Each thread gets its own ThreadCache via `thread_local!`. The fast path
//! (thread cache hit) requires zero synchronization. An empty list refills
//! with a batch from the central cache; a list over its high-water mark
//! spills three quarters of itself back.

use crate::central_cache::CentralCache;
use crate::page_cache::PageCache;
use crate::size_class;
use crate::span::FreeBlock;
use crate::{ALIGNMENT, MAX_POOLED, NUM_CLASSES};
use core::alloc::Layout;
use core::ptr;
use std::sync::Mutex;

/// Per-list block count above which a spill is triggered.
pub const T_RELEASE: usize = 1 << 17;

/// Per-size-class free list within the thread cache.
struct FreeList {
    /// Head of the singly-linked intrusive free list.
    head: *mut FreeBlock,
    /// Number of blocks currently on this list.
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    fn pop(&mut self) -> *mut FreeBlock {
        let block = self.head;
        if !block.is_null() {
            self.head = unsafe { (*block).next };
            self.len -= 1;
        }
        block
    }

    #[inline]
    fn push(&mut self, block: *mut FreeBlock) {
        unsafe { (*block).next = self.head };
        self.head = block;
        self.len += 1;
    }

    /// Push an already-linked chain of `count` blocks.
    fn push_chain(&mut self, head: *mut FreeBlock, count: usize) {
        if head.is_null() || count == 0 {
            return;
        }
        let mut tail = head;
        unsafe {
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            (*tail).next = self.head;
        }
        self.head = head;
        self.len += count;
    }
}

/// Per-thread cache holding one free list per size class.
pub struct ThreadCache {
    lists: [FreeList; NUM_CLASSES],
    /// List length that triggers a spill; `T_RELEASE` in production.
    spill_limit: usize,
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self::with_spill_limit(T_RELEASE)
    }

    /// Cache with a custom spill threshold; tests use small values to make
    /// spills and drains observable.
    pub const fn with_spill_limit(spill_limit: usize) -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_CLASSES],
            spill_limit,
        }
    }

    /// Acquire a block of `size` bytes.
    ///
    /// Zero-sized requests return null; oversized ones go straight to the
    /// OS allocator. Returns null when every tier fails.
    ///
    /// # Safety
    ///
    /// `self` must be this thread's cache, never shared.
    pub unsafe fn allocate(
        &mut self,
        size: usize,
        central: &CentralCache,
        page_cache: &Mutex<PageCache>,
    ) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        if size > MAX_POOLED {
            return unsafe { oversized_alloc(size) };
        }
        let class = size_class::class_of(size);
        let block = self.lists[class].pop();
        if !block.is_null() {
            return block as *mut u8;
        }
        unsafe { self.refill(class, central, page_cache) }
    }

    /// Release a block previously acquired with `allocate(size)`.
    ///
    /// Null pointers and zero sizes are no-ops.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` with the same `size` and must not be
    /// used again.
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
        central: &CentralCache,
        page_cache: &Mutex<PageCache>,
    ) {
        if ptr.is_null() || size == 0 {
            return;
        }
        if size > MAX_POOLED {
            unsafe { oversized_free(ptr, size) };
            return;
        }
        let class = size_class::class_of(size);
        self.lists[class].push(ptr as *mut FreeBlock);
        if self.lists[class].len > self.spill_limit {
            unsafe { self.spill(class, central, page_cache) };
        }
    }

    /// Slow path: fetch a batch from the central cache. The first block goes
    /// to the caller, the rest onto the local list.
    #[cold]
    unsafe fn refill(
        &mut self,
        class: usize,
        central: &CentralCache,
        page_cache: &Mutex<PageCache>,
    ) -> *mut u8 {
        let (count, head) = central.fetch_to_thread_cache(class, page_cache);
        if count == 0 || head.is_null() {
            return ptr::null_mut();
        }
        let rest = unsafe { (*head).next };
        if count > 1 {
            self.lists[class].push_chain(rest, count - 1);
        }
        head as *mut u8
    }

    /// Keep a quarter of the list, hand the rest back to the central cache.
    unsafe fn spill(
        &mut self,
        class: usize,
        central: &CentralCache,
        page_cache: &Mutex<PageCache>,
    ) {
        let list = &mut self.lists[class];
        let len = list.len;
        if len <= 1 {
            return;
        }
        let keep = (len / 4).max(1);

        unsafe {
            let mut boundary = list.head;
            for _ in 1..keep {
                boundary = (*boundary).next;
            }
            let spilled = (*boundary).next;
            (*boundary).next = ptr::null_mut();
            list.len = keep;
            central.receive_from_thread_cache(spilled, len - keep, class, page_cache);
        }
    }
}

/// Requests above `MAX_POOLED` bypass the tiers entirely.
#[cold]
pub(crate) unsafe fn oversized_alloc(size: usize) -> *mut u8 {
    // SAFETY: size >= 1 and ALIGNMENT is a power of two.
    let layout = unsafe { Layout::from_size_align_unchecked(size, ALIGNMENT) };
    unsafe { std::alloc::alloc(layout) }
}

#[cold]
pub(crate) unsafe fn oversized_free(ptr: *mut u8, size: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size, ALIGNMENT) };
    unsafe { std::alloc::dealloc(ptr, layout) }
}
