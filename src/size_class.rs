//! Size class math and transfer schedules.
//!
//! Classes are linear: class `k` serves blocks of exactly `(k + 1) * 8`
//! bytes, from 8 bytes up to [`MAX_POOLED`]. The schedules in this module
//! decide how many blocks move between tiers per locked operation and how
//! many pages back a fresh span.

use crate::{ALIGNMENT, MAX_POOLED, PAGE_SIZE};

/// Map an allocation size to its size class index.
///
/// Callers guarantee `1 <= size <= MAX_POOLED`; sizes of 0 and oversized
/// requests are filtered out before class derivation.
#[inline]
pub fn class_of(size: usize) -> usize {
    debug_assert!(size >= 1 && size <= MAX_POOLED);
    (size - 1) / ALIGNMENT
}

/// Block size served by a class.
#[inline]
pub const fn class_to_size(class: usize) -> usize {
    (class + 1) * ALIGNMENT
}

/// Number of blocks the central cache hands to a thread cache per fetch.
///
/// Smaller classes get larger batches to amortize the per-class lock.
pub fn batch_size(class: usize) -> usize {
    let size = class_to_size(class);
    if size <= 64 {
        160
    } else if size <= 128 {
        128
    } else if size <= 256 {
        64
    } else if size <= 512 {
        32
    } else if size <= 1024 {
        24
    } else {
        8
    }
}

/// Number of pages the page cache supplies per span of a class.
///
/// Targets several batches worth of blocks per span, then clamps to keep a
/// single fetch from pulling too many pages at once.
pub fn pages_per_span(class: usize) -> usize {
    let size = class_to_size(class);

    let multiplier = if size <= 64 {
        12
    } else if size <= 128 {
        10
    } else if size <= 256 {
        8
    } else if size <= 512 {
        6
    } else {
        4
    };

    let target_blocks = multiplier * batch_size(class);
    let bytes_needed = target_blocks * size;
    let pages = (bytes_needed + PAGE_SIZE - 1) / PAGE_SIZE;

    let max_pages = if size <= 128 {
        16
    } else if size <= 512 {
        8
    } else {
        4
    };

    pages.clamp(1, max_pages)
}

/// Blocks a span of `num_pages` pages yields for a class.
#[inline]
pub const fn blocks_per_span(class: usize, num_pages: usize) -> usize {
    (num_pages * PAGE_SIZE) / class_to_size(class)
}
