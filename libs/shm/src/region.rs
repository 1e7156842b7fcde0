// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The shared virtual region and its per-process slots.
//!
//! One mapping holds `nproc + 1` slots of exactly [`PROC_MEMORY`] bytes,
//! aligned to [`PROC_MEMORY`]. Slot 0 is the global area ([`Shared`]: the
//! cross-process heap queues and events are allocated from); slot `i + 1`
//! belongs to worker `i` and starts with its [`Proc`] parking header,
//! followed by the worker's own heap space.
//!
//! The alignment is the whole trick: masking any address allocated from a
//! worker slot with `PROC_MEMORY - 1` yields the slot base, i.e. the owning
//! worker's [`Proc`]. Queues and events use this to know which process to
//! unpark when they complete a future, without any lookup table.
//!
//! The region must be created before workers are spawned (fork or threads)
//! so every participant sees it at the same address.

use core::ptr::NonNull;

use simvat_arena::{CACHELINE_SIZE, MapFailed, vm};

use crate::heap::{Shared, WorkerHeap};
use crate::park::Proc;

/// Size and alignment of one process slot. Power of two; virtual memory is
/// committed lazily, so slots are deliberately huge.
pub const PROC_MEMORY: usize = 1 << 32;

/// The mapping holding the global slot plus one slot per worker.
pub struct SharedRegion {
    base: NonNull<u8>,
    nproc: usize,
}

// Safety: the region is plain shared memory; the structures inside carry
// their own synchronization.
unsafe impl Send for SharedRegion {}
// Safety: see above.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Maps the region for `nproc` workers.
    ///
    /// Over-allocates by one slot, trims the unaligned head and tail, and
    /// initializes the global slot.
    ///
    /// # Errors
    ///
    /// Returns [`MapFailed`] if the kernel refuses the mapping.
    pub fn new(nproc: usize) -> Result<Self, MapFailed> {
        let total = PROC_MEMORY
            .checked_mul(nproc + 1)
            .ok_or(MapFailed)?;
        let raw = vm::map_shared(total.checked_add(PROC_MEMORY).ok_or(MapFailed)?)?;
        let raw_addr = raw.as_ptr().addr();
        let aligned = (raw_addr + PROC_MEMORY - 1) & !(PROC_MEMORY - 1);
        let lead = aligned - raw_addr;
        // Safety: trimming the unaligned head and tail of the mapping we
        // just created; the aligned middle stays mapped.
        unsafe {
            if lead != 0 {
                vm::unmap(raw, lead);
            }
            let trail = PROC_MEMORY - lead;
            if trail != 0 {
                vm::unmap(raw.add(lead + total), trail);
            }
        }
        let base = raw.with_addr(
            // Safety: aligned is inside the mapping, hence non-zero.
            unsafe { core::num::NonZero::new_unchecked(aligned) },
        );
        tracing::debug!(nproc, base = aligned, "mapped shared region");
        // Safety: slot 0 is writable zeroed shared memory; the heap range
        // starts cache-line aligned past the Shared header.
        unsafe {
            let heap_base = aligned + size_of::<Shared>().next_multiple_of(CACHELINE_SIZE);
            Shared::init_at(base.as_ptr().cast::<Shared>(), heap_base, aligned + PROC_MEMORY);
            for i in 0..nproc {
                base.add((i + 1) * PROC_MEMORY).cast::<Proc>().write(Proc::new());
            }
        }
        Ok(Self { base, nproc })
    }

    #[inline]
    #[must_use]
    pub fn nproc(&self) -> usize {
        self.nproc
    }

    /// The global slot.
    #[inline]
    #[must_use]
    pub fn shared(&self) -> &Shared {
        // Safety: initialized in `new`, lives as long as the region.
        unsafe { self.base.cast::<Shared>().as_ref() }
    }

    /// Worker `i`'s parking header.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    #[must_use]
    pub fn proc(&self, i: usize) -> &Proc {
        assert!(i < self.nproc);
        // Safety: initialized in `new`, lives as long as the region.
        unsafe { self.base.add((i + 1) * PROC_MEMORY).cast::<Proc>().as_ref() }
    }

    /// Takes worker `i`'s private heap over its slot.
    ///
    /// # Safety
    ///
    /// Must be called at most once per worker, by the participant that owns
    /// the slot; the returned heap must not outlive the region.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    #[must_use]
    pub unsafe fn worker_heap(&self, i: usize) -> WorkerHeap {
        assert!(i < self.nproc);
        let slot = self.base.addr().get() + (i + 1) * PROC_MEMORY;
        let heap_base = slot + size_of::<Proc>().next_multiple_of(CACHELINE_SIZE);
        // Safety: the slot past the Proc header belongs exclusively to
        // worker `i` per this function's contract.
        unsafe { WorkerHeap::new(heap_base, slot + PROC_MEMORY) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Safety: `base..base + (nproc + 1) * PROC_MEMORY` is exactly the
        // trimmed mapping created in `new`.
        unsafe { vm::unmap(self.base, (self.nproc + 1) * PROC_MEMORY) }
    }
}

/// Recovers the [`Proc`] owning `ptr` by masking its address.
///
/// # Safety
///
/// `ptr` must point into a worker slot of a live [`SharedRegion`].
pub(crate) unsafe fn owner<'a, T>(ptr: *const T) -> &'a Proc {
    let base = ptr.addr() & !(PROC_MEMORY - 1);
    // Safety: the slot base holds the worker's Proc per the caller's
    // contract.
    unsafe { &*ptr.with_addr(base).cast::<Proc>() }
}
