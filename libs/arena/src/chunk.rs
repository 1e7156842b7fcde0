// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mapped memory chunks.
//!
//! A chunk is a single page-aligned anonymous mapping. Its last 16 bytes hold
//! a [`ChunkFooter`] linking it to the previously mapped chunk, so an arena
//! can walk and release its whole chain from just one footer pointer.

use core::ptr::NonNull;

use crate::bump::AllocError;
use crate::vm;

pub(crate) const FOOTER_SIZE: usize = size_of::<ChunkFooter>();

/// Trailer stored at the high end of every chunk.
#[repr(C)]
pub(crate) struct ChunkFooter {
    /// Next-older chunk in the chain, if any.
    pub(crate) prev: Option<NonNull<ChunkFooter>>,
    /// Full mapping size of the chunk this footer terminates, footer included.
    pub(crate) size: usize,
}

impl ChunkFooter {
    /// Base address of the chunk terminated by this footer.
    pub(crate) fn base(&self) -> NonNull<u8> {
        let end = core::ptr::from_ref(self).addr() + FOOTER_SIZE;
        // Safety: the footer lives at `base + size - FOOTER_SIZE` of a live
        // mapping, so `end - size` is that mapping's non-null base.
        unsafe { NonNull::new_unchecked(core::ptr::from_ref(self).cast_mut().cast::<u8>().with_addr(end - self.size)) }
    }

    /// Usable bytes below the footer.
    pub(crate) fn top(&self) -> usize {
        self.size - FOOTER_SIZE
    }
}

/// Maps a zero-filled chunk of exactly `size` bytes (`size` page-aligned and
/// large enough for the footer) and links it in front of `prev`.
pub(crate) fn map(size: usize, prev: Option<NonNull<ChunkFooter>>) -> Result<NonNull<ChunkFooter>, AllocError> {
    debug_assert!(size % vm::PAGE_SIZE == 0 && size >= FOOTER_SIZE);
    let base = vm::map_arena(size).map_err(|vm::MapFailed| AllocError)?;
    tracing::trace!(size, "mapped arena chunk");
    // Safety: `base + size - FOOTER_SIZE` is in bounds and page alignment
    // makes it well-aligned for ChunkFooter.
    unsafe {
        let footer = base.add(size - FOOTER_SIZE).cast::<ChunkFooter>();
        footer.write(ChunkFooter { prev, size });
        Ok(footer)
    }
}

/// Unmaps the chunk terminated by `footer`.
///
/// # Safety
///
/// `footer` must come from [`map`] and must not be used afterwards; the chain
/// link to older chunks is lost with it.
pub(crate) unsafe fn unmap(footer: NonNull<ChunkFooter>) {
    // Safety: footer is live per the caller's contract.
    let (base, size) = unsafe {
        let f = footer.as_ref();
        (f.base(), f.size)
    };
    // Safety: `base..base + size` is exactly the mapping created by `map`.
    unsafe { vm::unmap(base, size) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_roundtrip() {
        let footer = map(2 * vm::PAGE_SIZE, None).unwrap();
        // Safety: chunk is live.
        unsafe {
            let f = footer.as_ref();
            assert_eq!(f.size, 2 * vm::PAGE_SIZE);
            assert_eq!(f.top(), 2 * vm::PAGE_SIZE - FOOTER_SIZE);
            assert_eq!(f.base().add(f.top()).cast::<ChunkFooter>(), footer);
            unmap(footer);
        }
    }

    #[test]
    fn chain_links() {
        let old = map(vm::PAGE_SIZE, None).unwrap();
        let new = map(vm::PAGE_SIZE, Some(old)).unwrap();
        // Safety: both chunks are live.
        unsafe {
            assert_eq!(new.as_ref().prev, Some(old));
            unmap(new);
            unmap(old);
        }
    }
}
