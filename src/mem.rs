//! Shared anonymous mappings and the allocator contract.

use crate::util::fatal;

/// Page-aligned `MAP_SHARED | MAP_ANONYMOUS` mapping.
///
/// Shared mappings survive the snapshot fork with one backing store, which
/// is how the child scanner publishes the sorted working set back to the
/// parent without copying.
pub struct SharedMmap {
    start: *mut u8,
    size: usize,
}

impl SharedMmap {
    pub fn new(size: usize) -> SharedMmap {
        unsafe {
            let map = libc::mmap(
                core::ptr::null_mut(),
                size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                fatal!("shared mmap of {} bytes failed", size);
            }
            SharedMmap {
                start: map as *mut u8,
                size,
            }
        }
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SharedMmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.start as *mut _, self.size as _);
        }
    }
}

unsafe impl Send for SharedMmap {}

/// Usable extent of a live malloc block. The allocator shim guarantees a
/// non-zero answer for every retired pointer; zero here is fatal upstream.
pub fn usable_size(addr: usize) -> usize {
    unsafe { libc::malloc_usable_size(addr as *mut libc::c_void) }
}

/// Hand a reclaimed block back to the allocator.
///
/// # Safety
///
/// `addr` must be a live malloc block that no thread will touch again.
pub unsafe fn release(addr: usize) {
    libc::free(addr as *mut libc::c_void);
}
