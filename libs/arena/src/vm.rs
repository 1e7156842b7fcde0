// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Anonymous virtual-memory mappings.
//!
//! All large allocations in the simulation core are backed by lazily
//! committed anonymous mappings (`MAP_NORESERVE`), either process-private
//! (arena chunks) or shared (the multi-process region in `simvat-shm`).
//! Mapped pages are excluded from core dumps; simulation working memory is
//! bulky and reconstructible.

use core::ffi::c_void;
use core::fmt;
use core::ptr::NonNull;

pub const PAGE_SIZE: usize = 4096;
pub const CACHELINE_SIZE: usize = 64;

/// A virtual mapping request returned no address.
///
/// This is the only error the OS layer produces; callers translate it into
/// their own error vocabulary (`AllocError` for arenas, `Error::MapFailed`
/// at the engine surface).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MapFailed;

impl fmt::Display for MapFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("virtual memory mapping failed")
    }
}

impl core::error::Error for MapFailed {}

/// Rounds `size` up to the next multiple of the page size.
#[inline]
#[must_use]
pub const fn page_align(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn map(size: usize, flags: i32) -> Result<NonNull<u8>, MapFailed> {
            debug_assert!(size % PAGE_SIZE == 0);
            // Safety: anonymous mapping, no fd or address hint involved.
            let ptr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(MapFailed);
            }
            #[cfg(target_os = "linux")]
            // Safety: `ptr` is the base of a live `size`-byte mapping. Advice
            // failures are ignored; DONTDUMP is best-effort.
            unsafe {
                libc::madvise(ptr, size, libc::MADV_DONTDUMP);
            }
            // Safety: mmap success is non-null.
            Ok(unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) })
        }

        /// Maps `size` bytes (page-rounded) of zero-filled private memory.
        ///
        /// # Errors
        ///
        /// Returns [`MapFailed`] if the kernel refuses the mapping.
        pub fn map_arena(size: usize) -> Result<NonNull<u8>, MapFailed> {
            map(page_align(size), libc::MAP_PRIVATE)
        }

        /// Maps `size` bytes (page-rounded) of zero-filled memory shared with
        /// every process forked after the call.
        ///
        /// # Errors
        ///
        /// Returns [`MapFailed`] if the kernel refuses the mapping.
        pub fn map_shared(size: usize) -> Result<NonNull<u8>, MapFailed> {
            map(page_align(size), libc::MAP_SHARED)
        }

        /// Releases a mapping previously returned by [`map_arena`] or
        /// [`map_shared`], or any page-aligned sub-range of one.
        ///
        /// # Safety
        ///
        /// `base..base + size` must be a live mapping (or page-aligned slice
        /// of one) that no other reference observes afterwards.
        pub unsafe fn unmap(base: NonNull<u8>, size: usize) {
            // Safety: contract forwarded to the caller.
            unsafe {
                libc::munmap(base.as_ptr().cast::<c_void>(), page_align(size));
            }
        }
    } else {
        compile_error!("simvat only supports unix targets");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_rounds_to_pages() {
        let ptr = map_arena(1).unwrap();
        // the whole rounded page must be addressable and zeroed
        // Safety: we own the fresh one-page mapping.
        unsafe {
            let page = core::slice::from_raw_parts_mut(ptr.as_ptr(), PAGE_SIZE);
            assert!(page.iter().all(|&b| b == 0));
            page[PAGE_SIZE - 1] = 0xAB;
            unmap(ptr, 1);
        }
    }

    #[test]
    fn page_align_boundaries() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), PAGE_SIZE);
        assert_eq!(page_align(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_align(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }
}
