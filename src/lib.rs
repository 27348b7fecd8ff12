//! mempool: a thread-caching pool allocator for small and medium blocks.
//!
//! Three tiers cooperate to keep the common path lock-free:
//! - Thread caches (per-thread free lists, no synchronization)
//! - Central cache (per-size-class spinlocks, batch transfers)
//! - Page cache (span management, OS interface)
//!
//! The API is sized: the caller passes the allocation size back on release,
//! so blocks carry no headers. Requests above [`MAX_POOLED`] are delegated
//! to the operating system allocator.
//!
//! # Usage
//!
//! ```
//! let p = mempool::allocate(64);
//! assert!(!p.is_null());
//! unsafe { mempool::deallocate(p, 64) };
//! ```

pub mod size_class;
pub mod platform;
pub mod sync;
pub mod span;
pub mod page_cache;
pub mod central_cache;
pub mod thread_cache;
pub mod allocator;

/// Block alignment. Every pooled address is a multiple of this, and a free
/// block must hold one pointer, so it can never go below
/// `size_of::<usize>()`.
pub const ALIGNMENT: usize = 8;

/// OS page size assumed by the span machinery (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of size classes. Class `k` serves blocks of `(k + 1) * ALIGNMENT`
/// bytes.
pub const NUM_CLASSES: usize = 2048;

/// Largest pooled request (16 KiB). Anything bigger bypasses the tiers.
pub const MAX_POOLED: usize = NUM_CLASSES * ALIGNMENT;

const _: () = assert!(ALIGNMENT >= core::mem::size_of::<usize>());
const _: () = assert!(MAX_POOLED % PAGE_SIZE == 0);

// Re-export the public API at crate root for convenience
pub use allocator::{allocate, deallocate};
