//! Central cache (middle tier): size-sharded reservoir between the thread
//! caches and the page cache.
//!
//! Each size class owns an intrusive free list behind its own spinlock.
//! Blocks move in batches: a fetch detaches a chain for a thread cache, a
//! receive splices a spilled chain back in. Returns are counted per class,
//! and once enough accumulate (or enough time passes) a drain hands every
//! fully-free span of that class back to the page cache.
//!
//! Span trackers live in a table shared by all classes. Slots have stable
//! indices and are never relocated: registration claims a free slot with a
//! compare-exchange and publishes the base address last, retirement zeroes
//! the address. Every class-k slot is only registered, retired, or counted
//! while `lock[k]` is held, so a lookup for class k (itself under `lock[k]`)
//! can never observe a class-k slot in motion.

use crate::page_cache::PageCache;
use crate::size_class;
use crate::span::{self, FreeBlock};
use crate::sync::SpinMutex;
use crate::{NUM_CLASSES, PAGE_SIZE};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Returned blocks that trigger a drain evaluation.
pub const MAX_DELAY_COUNT: usize = 48;

/// Elapsed time since the last drain that triggers one regardless of count.
pub const MAX_DELAY_DURATION: Duration = Duration::from_millis(1000);

/// Capacity of the span tracker table. On overflow a span simply goes
/// untracked: it still serves blocks but is never returned to the page
/// cache.
pub const TRACKER_SLOTS: usize = 1024;

/// Slot claimed but not yet published.
const SLOT_RESERVED: usize = usize::MAX;

/// One live span as the central cache sees it.
struct SpanTracker {
    /// Span base address; 0 marks a free slot, `SLOT_RESERVED` one
    /// mid-registration.
    addr: AtomicUsize,
    num_pages: AtomicUsize,
    total_blocks: AtomicUsize,
    /// Blocks of this span currently on the central list of its class.
    free_blocks: AtomicUsize,
    class: AtomicUsize,
}

impl SpanTracker {
    const fn new() -> Self {
        Self {
            addr: AtomicUsize::new(0),
            num_pages: AtomicUsize::new(0),
            total_blocks: AtomicUsize::new(0),
            free_blocks: AtomicUsize::new(0),
            class: AtomicUsize::new(0),
        }
    }
}

struct TrackerTable {
    slots: [SpanTracker; TRACKER_SLOTS],
    /// Upper bound on ever-claimed slot indices; bounds lookup scans.
    high_water: AtomicUsize,
}

impl TrackerTable {
    const fn new() -> Self {
        Self {
            slots: [const { SpanTracker::new() }; TRACKER_SLOTS],
            high_water: AtomicUsize::new(0),
        }
    }

    /// Publish a tracker for a freshly sliced span. False when the table is
    /// full; the span then stays untracked.
    fn register(
        &self,
        addr: usize,
        num_pages: usize,
        class: usize,
        total_blocks: usize,
        free_blocks: usize,
    ) -> bool {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .addr
                .compare_exchange(0, SLOT_RESERVED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                slot.num_pages.store(num_pages, Ordering::Relaxed);
                slot.total_blocks.store(total_blocks, Ordering::Relaxed);
                slot.free_blocks.store(free_blocks, Ordering::Relaxed);
                slot.class.store(class, Ordering::Relaxed);
                // Publish last: a lookup that sees the address sees the rest.
                slot.addr.store(addr, Ordering::Release);
                self.high_water.fetch_max(i + 1, Ordering::AcqRel);
                return true;
            }
        }
        false
    }

    fn retire(&self, slot: &SpanTracker) {
        slot.addr.store(0, Ordering::Release);
    }

    /// Find the live class-`class` tracker whose span contains `addr`.
    ///
    /// Callers hold `lock[class]`, which freezes every class-`class` slot;
    /// slots of other classes may churn underneath the scan but are filtered
    /// out before their fields are trusted.
    fn find(&self, addr: usize, class: usize) -> Option<&SpanTracker> {
        let high = self.high_water.load(Ordering::Acquire);
        for slot in &self.slots[..high] {
            let base = slot.addr.load(Ordering::Acquire);
            if base == 0 || base == SLOT_RESERVED {
                continue;
            }
            if slot.class.load(Ordering::Relaxed) != class {
                continue;
            }
            let num_pages = slot.num_pages.load(Ordering::Relaxed);
            if addr >= base && addr < base + num_pages * PAGE_SIZE {
                return Some(slot);
            }
        }
        None
    }
}

/// Per-class state, everything behind that class's spinlock.
struct ClassList {
    head: *mut FreeBlock,
    /// Blocks returned since the last drain evaluation reset.
    delay_count: usize,
    /// When the last drain ran; None until the first return.
    last_return: Option<Instant>,
}

// SAFETY: the list head is only touched under the owning shard's lock.
unsafe impl Send for ClassList {}

impl ClassList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            delay_count: 0,
            last_return: None,
        }
    }
}

pub struct CentralCache {
    shards: [SpinMutex<ClassList>; NUM_CLASSES],
    trackers: TrackerTable,
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            shards: [const { SpinMutex::new(ClassList::new()) }; NUM_CLASSES],
            trackers: TrackerTable::new(),
        }
    }

    /// Hand a batch of class-`class` blocks to a thread cache.
    ///
    /// Returns the chain head and its length; `(0, null)` when the page
    /// cache cannot supply a span.
    pub fn fetch_to_thread_cache(
        &self,
        class: usize,
        page_cache: &Mutex<PageCache>,
    ) -> (usize, *mut FreeBlock) {
        self.fetch_limited(class, size_class::batch_size(class), page_cache)
    }

    /// Like `fetch_to_thread_cache` with an explicit batch ceiling. The
    /// facade uses a ceiling of one when no thread cache is available to
    /// hold a remainder.
    pub(crate) fn fetch_limited(
        &self,
        class: usize,
        max_batch: usize,
        page_cache: &Mutex<PageCache>,
    ) -> (usize, *mut FreeBlock) {
        debug_assert!(class < NUM_CLASSES && max_batch >= 1);
        let mut list = self.shards[class].lock();

        if list.head.is_null() {
            return self.refill_and_take(&mut list, class, max_batch, page_cache);
        }

        // Detach up to `max_batch` nodes from the existing list, telling
        // each owning tracker its block is leaving the central tier.
        let head = list.head;
        let mut tail = head;
        let mut count = 1usize;
        unsafe {
            self.note_taken(tail as usize, class);
            while count < max_batch && !(*tail).next.is_null() {
                tail = (*tail).next;
                self.note_taken(tail as usize, class);
                count += 1;
            }
            list.head = (*tail).next;
            (*tail).next = ptr::null_mut();
        }
        (count, head)
    }

    /// Accept a spilled chain of `count` class-`class` blocks.
    ///
    /// # Safety
    ///
    /// `head` must start a null-terminated chain of at least `count` free
    /// blocks of this class, owned by the caller and on no other list.
    pub unsafe fn receive_from_thread_cache(
        &self,
        head: *mut FreeBlock,
        count: usize,
        class: usize,
        page_cache: &Mutex<PageCache>,
    ) {
        if head.is_null() || count == 0 || class >= NUM_CLASSES {
            return;
        }
        let mut list = self.shards[class].lock();

        // Walk to the chain's tail (bounded by `count`), crediting each
        // block back to its span, then splice the old list after it.
        let mut tail = head;
        let mut returned = 1usize;
        unsafe {
            self.note_returned(tail as usize, class);
            while returned < count && !(*tail).next.is_null() {
                tail = (*tail).next;
                self.note_returned(tail as usize, class);
                returned += 1;
            }
            (*tail).next = list.head;
        }
        list.head = head;
        list.delay_count += returned;

        let now = Instant::now();
        let since = *list.last_return.get_or_insert(now);
        if list.delay_count >= MAX_DELAY_COUNT || now.duration_since(since) >= MAX_DELAY_DURATION {
            self.drain(&mut list, class, page_cache, now);
        }
    }

    /// Slow path: pull a span from the page cache, slice it, and split off
    /// the requested batch. The remainder stays on the central list.
    fn refill_and_take(
        &self,
        list: &mut ClassList,
        class: usize,
        max_batch: usize,
        page_cache: &Mutex<PageCache>,
    ) -> (usize, *mut FreeBlock) {
        let block_size = size_class::class_to_size(class);
        let num_pages = size_class::pages_per_span(class);

        let span_addr = lock_page_cache(page_cache).allocate_span(num_pages);
        if span_addr == 0 {
            return (0, ptr::null_mut());
        }

        // SAFETY: the span is fresh from the page cache and exclusively ours.
        let (total, chain) = unsafe { span::slice_span(span_addr as *mut u8, num_pages, block_size) };
        let take = max_batch.min(total);

        unsafe {
            let mut tail = chain;
            for _ in 1..take {
                tail = (*tail).next;
            }
            list.head = (*tail).next;
            (*tail).next = ptr::null_mut();
        }

        self.trackers
            .register(span_addr, num_pages, class, total, total - take);
        (take, chain)
    }

    /// Return every fully-free span of this class to the page cache.
    ///
    /// Runs under `lock[class]`: only this class's list is touched and only
    /// spans assigned to this class are eligible.
    fn drain(
        &self,
        list: &mut ClassList,
        class: usize,
        page_cache: &Mutex<PageCache>,
        now: Instant,
    ) {
        let high = self.trackers.high_water.load(Ordering::Acquire);
        for slot in &self.trackers.slots[..high] {
            let base = slot.addr.load(Ordering::Acquire);
            if base == 0 || base == SLOT_RESERVED {
                continue;
            }
            if slot.class.load(Ordering::Relaxed) != class {
                continue;
            }
            let total = slot.total_blocks.load(Ordering::Relaxed);
            if slot.free_blocks.load(Ordering::Relaxed) != total {
                continue;
            }

            let num_pages = slot.num_pages.load(Ordering::Relaxed);
            // SAFETY: under lock[class]; every filtered block is free and
            // belongs to this span.
            unsafe { filter_span_blocks(list, base, num_pages) };
            lock_page_cache(page_cache).deallocate_span(base, num_pages);
            self.trackers.retire(slot);
        }
        list.delay_count = 0;
        list.last_return = Some(now);
    }

    fn note_taken(&self, block_addr: usize, class: usize) {
        if let Some(tracker) = self.trackers.find(block_addr, class) {
            tracker.free_blocks.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn note_returned(&self, block_addr: usize, class: usize) {
        if let Some(tracker) = self.trackers.find(block_addr, class) {
            tracker.free_blocks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Unlink every block lying inside `[base, base + num_pages * PAGE_SIZE)`
/// from the class list, preserving the order of the rest.
///
/// # Safety
///
/// Caller holds the class lock; every node on the list is a valid free
/// block.
unsafe fn filter_span_blocks(list: &mut ClassList, base: usize, num_pages: usize) {
    let end = base + num_pages * PAGE_SIZE;
    let mut new_head: *mut FreeBlock = ptr::null_mut();
    let mut prev: *mut FreeBlock = ptr::null_mut();
    let mut cur = list.head;
    unsafe {
        while !cur.is_null() {
            let next = (*cur).next;
            let addr = cur as usize;
            if addr < base || addr >= end {
                if prev.is_null() {
                    new_head = cur;
                } else {
                    (*prev).next = cur;
                }
                prev = cur;
            }
            cur = next;
        }
        if !prev.is_null() {
            (*prev).next = ptr::null_mut();
        }
    }
    list.head = new_head;
}

/// The page cache mutex never protects panicking code; if a panic poisons it
/// anyway, keep serving from the inner state.
fn lock_page_cache(page_cache: &Mutex<PageCache>) -> std::sync::MutexGuard<'_, PageCache> {
    page_cache.lock().unwrap_or_else(PoisonError::into_inner)
}
