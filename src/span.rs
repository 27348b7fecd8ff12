//! Intrusive free-block chains.
//!
//! While a block is free, its first word stores the address of the next free
//! block; live blocks are opaque bytes. All pointer punning in the crate is
//! confined to this module: a raw block address becomes a [`FreeBlock`] here
//! and nowhere else.

use crate::PAGE_SIZE;
use core::ptr;

/// View of a free block's first word.
#[repr(C)]
pub struct FreeBlock {
    pub next: *mut FreeBlock,
}

/// Carve a span into a chain of `block_size`-byte blocks.
///
/// Links every block at `base + i * block_size` to its successor and
/// null-terminates the last one. Returns the block count and the chain head.
///
/// # Safety
///
/// `base` must point at `num_pages * PAGE_SIZE` bytes of exclusively owned,
/// writable memory, and `block_size` must be at least one pointer wide.
pub unsafe fn slice_span(
    base: *mut u8,
    num_pages: usize,
    block_size: usize,
) -> (usize, *mut FreeBlock) {
    let total = (num_pages * PAGE_SIZE) / block_size;
    debug_assert!(total >= 1);
    unsafe {
        for i in 0..total - 1 {
            let block = base.add(i * block_size) as *mut FreeBlock;
            (*block).next = base.add((i + 1) * block_size) as *mut FreeBlock;
        }
        let last = base.add((total - 1) * block_size) as *mut FreeBlock;
        (*last).next = ptr::null_mut();
    }
    (total, base as *mut FreeBlock)
}

/// Length of a null-terminated chain.
///
/// # Safety
///
/// Every node reachable from `head` must be a valid free block.
pub unsafe fn chain_len(head: *mut FreeBlock) -> usize {
    let mut n = 0;
    let mut cur = head;
    while !cur.is_null() {
        n += 1;
        cur = unsafe { (*cur).next };
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform;

    #[test]
    fn test_slice_counts_and_terminates() {
        let base = platform::system_alloc(1);
        assert!(!base.is_null());
        let (total, head) = unsafe { slice_span(base, 1, 64) };
        assert_eq!(total, PAGE_SIZE / 64);
        assert_eq!(unsafe { chain_len(head) }, total);
    }

    #[test]
    fn test_slice_orders_blocks_by_address() {
        let base = platform::system_alloc(1);
        assert!(!base.is_null());
        let (_, head) = unsafe { slice_span(base, 1, 512) };
        let mut cur = head;
        let mut prev_addr = 0usize;
        while !cur.is_null() {
            assert!(cur as usize > prev_addr);
            prev_addr = cur as usize;
            cur = unsafe { (*cur).next };
        }
    }

    #[test]
    fn test_slice_drops_trailing_remainder() {
        // 4096 / 3072-byte blocks: one block, rest of the page unused.
        let base = platform::system_alloc(1);
        assert!(!base.is_null());
        let (total, head) = unsafe { slice_span(base, 1, 3072) };
        assert_eq!(total, 1);
        assert!(unsafe { (*head).next }.is_null());
    }
}
