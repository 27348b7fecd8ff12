//! Page cache (back-end): whole-span allocation, recycling, and coalescing.
//!
//! Hands out spans of a requested page count, accepts them back, and merges
//! a returned span with the free span that starts where it ends. Coalescing
//! is forward-only: the preceding neighbor is never merged. Traffic here is
//! orders of magnitude lower than at the central cache, so the facade wraps
//! the whole structure in one mutex.

use crate::platform;
use crate::PAGE_SIZE;
use std::collections::BTreeMap;

/// Record of one span the page cache has produced and not merged away.
struct PageSpan {
    num_pages: usize,
    /// Whether the span currently sits on a free bucket.
    free: bool,
}

pub struct PageCache {
    /// Page count -> bases of free spans with exactly that many pages.
    /// Buckets are LIFO and never left empty.
    free_spans: BTreeMap<usize, Vec<usize>>,
    /// Base address -> span record, for every span ever produced.
    spans: BTreeMap<usize, PageSpan>,
    /// Pages obtained from the OS since creation. Monotonic.
    mapped_pages: usize,
}

impl PageCache {
    pub const fn new() -> Self {
        Self {
            free_spans: BTreeMap::new(),
            spans: BTreeMap::new(),
            mapped_pages: 0,
        }
    }

    /// Allocate a span of exactly `num_pages` pages.
    ///
    /// Serves the smallest free span that fits, splitting off the leading
    /// pages and re-bucketing the remainder; maps fresh pages from the OS
    /// when nothing fits. Returns the base address, or 0 on failure.
    pub fn allocate_span(&mut self, num_pages: usize) -> usize {
        if num_pages == 0 {
            return 0;
        }

        let bucket_pages = match self.free_spans.range(num_pages..).next() {
            Some((&pages, _)) => pages,
            None => return self.map_fresh_span(num_pages),
        };

        let addr = match self.pop_bucket(bucket_pages) {
            Some(addr) => addr,
            None => return self.map_fresh_span(num_pages),
        };

        if bucket_pages > num_pages {
            let rest_addr = addr + num_pages * PAGE_SIZE;
            let rest_pages = bucket_pages - num_pages;
            self.spans.insert(
                rest_addr,
                PageSpan {
                    num_pages: rest_pages,
                    free: true,
                },
            );
            self.free_spans.entry(rest_pages).or_default().push(rest_addr);
        }

        if let Some(span) = self.spans.get_mut(&addr) {
            span.num_pages = num_pages;
            span.free = false;
        }
        addr
    }

    /// Return a span.
    ///
    /// Unknown addresses are silently ignored: they belong to someone else.
    pub fn deallocate_span(&mut self, addr: usize, num_pages: usize) {
        let span_pages = match self.spans.get(&addr) {
            Some(span) if !span.free => span.num_pages,
            _ => return,
        };
        debug_assert_eq!(span_pages, num_pages);

        // Forward coalescing: absorb the free span that starts at our end.
        let mut final_pages = span_pages;
        let next_addr = addr + span_pages * PAGE_SIZE;
        let next_pages = match self.spans.get(&next_addr) {
            Some(next) if next.free => Some(next.num_pages),
            _ => None,
        };
        if let Some(next_pages) = next_pages {
            if self.unlink_free_span(next_pages, next_addr) {
                self.spans.remove(&next_addr);
                final_pages += next_pages;
            }
        }

        if let Some(span) = self.spans.get_mut(&addr) {
            span.num_pages = final_pages;
            span.free = true;
        }
        self.free_spans.entry(final_pages).or_default().push(addr);
    }

    /// Number of free spans across all buckets.
    pub fn free_span_count(&self) -> usize {
        self.free_spans.values().map(Vec::len).sum()
    }

    /// Number of free spans of exactly `num_pages` pages.
    pub fn free_spans_of(&self, num_pages: usize) -> usize {
        self.free_spans.get(&num_pages).map_or(0, Vec::len)
    }

    /// Total pages sitting on free buckets.
    pub fn total_free_pages(&self) -> usize {
        self.free_spans
            .iter()
            .map(|(pages, bucket)| pages * bucket.len())
            .sum()
    }

    /// Total bytes ever mapped from the OS. Never shrinks.
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_pages * PAGE_SIZE
    }

    fn map_fresh_span(&mut self, num_pages: usize) -> usize {
        let addr = platform::system_alloc(num_pages) as usize;
        if addr == 0 {
            return 0;
        }
        self.mapped_pages += num_pages;
        self.spans.insert(
            addr,
            PageSpan {
                num_pages,
                free: false,
            },
        );
        addr
    }

    /// Take the most recently freed span from a bucket.
    fn pop_bucket(&mut self, num_pages: usize) -> Option<usize> {
        let bucket = self.free_spans.get_mut(&num_pages)?;
        let addr = bucket.pop();
        if bucket.is_empty() {
            self.free_spans.remove(&num_pages);
        }
        addr
    }

    /// Remove a specific span from its bucket. False if it is not there.
    fn unlink_free_span(&mut self, num_pages: usize, addr: usize) -> bool {
        let Some(bucket) = self.free_spans.get_mut(&num_pages) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|&base| base == addr) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.free_spans.remove(&num_pages);
        }
        true
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}
