use core::{alloc::Layout, ptr::NonNull};

use super::{Init, RawSource};

/// A [`RawSource`] backed by anonymous private memory mappings.
///
/// Regions are rounded up to the page size by the kernel and are
/// zero-filled. Alignments larger than the page size are not supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapSource;

impl Init for MmapSource {
    const INIT: Self = Self;
}

#[inline]
fn page_size() -> usize {
    // Safety: `sysconf` has no preconditions
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

unsafe impl RawSource for MmapSource {
    unsafe fn acquire(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > page_size() {
            return None;
        }

        let ptr = libc::mmap(
            core::ptr::null_mut(),
            layout.size(),
            libc::PROT_WRITE | libc::PROT_READ,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return None;
        }

        NonNull::new(ptr as *mut u8)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout) {
        let ret = libc::munmap(ptr.as_ptr() as *mut _, layout.size());
        debug_assert_eq!(ret, 0);
    }
}
