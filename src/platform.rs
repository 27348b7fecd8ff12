//! OS virtual-memory interface.
//!
//! One entry point: map `num_pages` pages of anonymous, read/write memory.
//! Pages are never handed back to the OS; the page cache retains every span
//! until process exit.

use crate::PAGE_SIZE;

/// Reserve and commit `num_pages * PAGE_SIZE` bytes. Returns null on failure.
#[cfg(unix)]
pub fn system_alloc(num_pages: usize) -> *mut u8 {
    use core::ptr;

    let len = num_pages * PAGE_SIZE;
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

/// Reserve and commit `num_pages * PAGE_SIZE` bytes. Returns null on failure.
#[cfg(windows)]
pub fn system_alloc(num_pages: usize) -> *mut u8 {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
    };

    let len = num_pages * PAGE_SIZE;
    let ptr = unsafe { VirtualAlloc(core::ptr::null(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
    ptr as *mut u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_writable_pages() {
        let ptr = system_alloc(2);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % PAGE_SIZE, 0);
        unsafe {
            for i in 0..2 * PAGE_SIZE {
                ptr.add(i).write((i % 251) as u8);
            }
            for i in 0..2 * PAGE_SIZE {
                assert_eq!(ptr.add(i).read(), (i % 251) as u8);
            }
        }
    }

    #[test]
    fn test_zero_pages_maps_nothing_usable() {
        // A zero-length mapping is allowed to fail; it must not crash.
        let _ = system_alloc(0);
    }
}
