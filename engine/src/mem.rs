// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The savepoint engine.
//!
//! Work memory is a fixed region of up to 64 equal blocks. The host declares
//! the blocks it is *about to* mutate with [`Mem::write`]; the engine copies
//! their current contents into the save slot of every ancestor savepoint
//! that lacks a backup, so any live savepoint can later be reconstructed by
//! walking the tree ([`Mem::load`]). Rolling back also resets the pending
//! frame arena (O(1)) and returns the window's object handles to the recycle
//! pool.
//!
//! Key invariants, maintained by every operation:
//! - a frame's `diff` and `save` masks are subsets of its parent's `save`;
//! - parent ids are strictly smaller than child ids;
//! - the pending `unsaved` mask is the complement of the cursor frame's
//!   `save` within the work area.

use alloc::vec::Vec;
use core::ptr::NonNull;

use simvat_arena::{Arena, PAGE_SIZE, Scratch, vm};
use smallvec::SmallVec;

use crate::config::{BLOCK_MAX, BLOCK_SIZE_MIN, FRAME_TABLE_MAX};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameId, FrameState};
use crate::handles::{Handles, ObjId};
use crate::mask::BlockMask;

/// The frame-save area: one `work_size`-byte slot per frame-table slot,
/// holding block copies. Grown (never shrunk) together with the frame table.
struct SaveArea {
    base: Option<NonNull<u8>>,
    slots: usize,
    work_size: usize,
}

impl SaveArea {
    fn new(work_size: usize) -> Self {
        Self {
            base: None,
            slots: 0,
            work_size,
        }
    }

    fn ensure(&mut self, slots: usize) -> Result<()> {
        if slots <= self.slots {
            return Ok(());
        }
        let new_slots = slots.next_power_of_two().max(8);
        let size = new_slots
            .checked_mul(self.work_size)
            .ok_or(Error::OutOfMemory)?;
        let new = vm::map_arena(size)?;
        if let Some(old) = self.base {
            // Safety: both regions are live and the old contents fit the
            // strictly larger new mapping.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    old.as_ptr(),
                    new.as_ptr(),
                    self.slots * self.work_size,
                );
                vm::unmap(old, self.slots * self.work_size);
            }
        }
        tracing::trace!(slots = new_slots, "grew frame-save area");
        self.base = Some(new);
        self.slots = new_slots;
        Ok(())
    }

    /// Base of frame `id`'s save slot.
    fn slot(&self, id: FrameId) -> *mut u8 {
        debug_assert!(id.index() < self.slots);
        // Safety: `ensure` ran for this slot; offset stays in the mapping.
        unsafe { self.base.expect("save area unmapped").add(id.index() * self.work_size) }.as_ptr()
    }
}

impl Drop for SaveArea {
    fn drop(&mut self) {
        if let Some(base) = self.base.take() {
            // Safety: exactly the mapping created in `ensure`.
            unsafe { vm::unmap(base, self.slots * self.work_size) }
        }
    }
}

/// The per-worker savepoint engine. Single-threaded cooperative: the host
/// never calls into it reentrantly or from two threads at once.
pub struct Mem {
    work: NonNull<u8>,
    block_size: usize,
    nblocks: u32,
    /// `BlockMask::all(nblocks)`.
    all: BlockMask,
    ftab: Vec<Frame>,
    fsave: SaveArea,
    handles: Handles,
    pub(crate) scratch: Scratch,
    /// The cursor: the frame the next savepoint will branch from.
    parent: FrameId,
    /// Blocks mutated since `parent`.
    diff: BlockMask,
    /// Complement of `parent`'s save mask; blocks with no backup there yet.
    unsaved: BlockMask,
    /// The active frame arena, handed to the next savepoint on `save`.
    pub(crate) framealloc: Arena,
    /// Set when an allocation failed inside `save`/`load`; the engine then
    /// refuses further saves and loads.
    wedged: bool,
}

// Safety: Mem is a single-owner structure; the host contract (§ single
// threaded cooperative) extends to the borrowed work region.
unsafe impl Send for Mem {}

impl Mem {
    /// Creates an engine over the caller's work memory.
    ///
    /// `work_size` must be `block_size * B` with `1 <= B <= 64`;
    /// `block_size` must be a power of two no smaller than
    /// [`BLOCK_SIZE_MIN`]; `work` must be cache-line aligned.
    ///
    /// # Safety
    ///
    /// `work..work + work_size` must stay valid and exclusively available to
    /// this engine (single-threaded) for the engine's whole lifetime.
    ///
    /// # Errors
    ///
    /// `InvalidArg` for bad geometry, `MapFailed` if the initial frame-save
    /// mapping fails.
    pub unsafe fn new(work: NonNull<u8>, work_size: usize, block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two() || block_size < BLOCK_SIZE_MIN {
            return Err(Error::InvalidArg("misaligned block size"));
        }
        if work_size == 0 || work_size % block_size != 0 {
            return Err(Error::InvalidArg("work size not a multiple of block size"));
        }
        let nblocks = work_size / block_size;
        if nblocks > BLOCK_MAX as usize {
            return Err(Error::InvalidArg("more than 64 blocks"));
        }
        #[expect(clippy::cast_possible_truncation, reason = "checked against BLOCK_MAX")]
        let nblocks = nblocks as u32;
        if work.addr().get() % BLOCK_SIZE_MIN != 0 {
            return Err(Error::InvalidArg("work memory not cache-line aligned"));
        }

        let all = BlockMask::all(nblocks);
        let mut root = Frame::unused();
        // the root is the universal fallback: permanently alive, diff covers
        // the whole work area
        root.diff = all;
        root.state = FrameState::new()
            .with(FrameState::ACTIVE, true)
            .with(FrameState::ALIVE, true);

        let mut fsave = SaveArea::new(work_size);
        fsave.ensure(1)?;

        tracing::debug!(work_size, block_size, nblocks, "savepoint engine initialized");
        Ok(Self {
            work,
            block_size,
            nblocks,
            all,
            ftab: alloc::vec![root],
            fsave,
            handles: Handles::new(),
            scratch: Scratch::new(),
            parent: FrameId::ROOT,
            diff: BlockMask::EMPTY,
            unsaved: all,
            framealloc: Arena::new(),
            wedged: false,
        })
    }

    /// The current cursor frame.
    #[inline]
    #[must_use]
    pub fn current(&self) -> FrameId {
        self.parent
    }

    /// Whether `id` is a live load target.
    #[must_use]
    pub fn is_alive(&self, id: FrameId) -> bool {
        self.ftab.get(id.index()).is_some_and(Frame::is_alive)
    }

    #[inline]
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    #[must_use]
    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// Creates a savepoint of the current work-memory state and makes it the
    /// new cursor.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the frame table hit [`FRAME_TABLE_MAX`] or the save
    /// area cannot grow; either failure wedges the engine.
    pub fn save(&mut self) -> Result<FrameId> {
        self.check_wedged()?;
        let parent = self.parent;
        let id = self.alloc_slot(parent).inspect_err(|_| self.wedged = true)?;

        let objref = self.handles.freeze_pending();
        let frame = &mut self.ftab[id.index()];
        frame.diff = self.diff;
        frame.save = BlockMask::EMPTY;
        frame.parent = parent;
        frame.state = FrameState::new()
            .with(FrameState::ACTIVE, true)
            .with(FrameState::ALIVE, true);
        frame.objref = objref;
        // the new frame takes ownership of everything allocated since the
        // previous save; the engine keeps the (reset, swept) slot arena for
        // the next window
        core::mem::swap(&mut frame.alloc, &mut self.framealloc);
        self.framealloc.reset();
        self.framealloc.sweep();

        self.ftab[parent.index()].add_child();
        self.parent = id;
        self.diff = BlockMask::EMPTY;
        self.unsaved = self.all;
        tracing::debug!(frame = %id, parent = %parent, "savepoint created");
        if cfg!(debug_assertions) {
            self.check_invariants();
        }
        Ok(id)
    }

    /// Declares that the host is **about to** mutate the blocks in `mask`.
    ///
    /// The engine copies the current contents of those blocks into the save
    /// slot of every ancestor savepoint that has no backup of them yet, so
    /// the declaration must happen before the bytes change.
    ///
    /// # Errors
    ///
    /// `InvalidArg` if `mask` has bits beyond the configured block count.
    pub fn write(&mut self, mask: BlockMask) -> Result<()> {
        if !self.all.contains_all(mask) {
            return Err(Error::InvalidArg("block index out of range"));
        }
        if mask.is_empty() {
            return Ok(());
        }
        self.diff |= mask;
        self.unsaved &= !mask;
        let mut f = self.parent;
        loop {
            let need = mask & !self.ftab[f.index()].save;
            if need.is_empty() {
                // by the subset invariant every further ancestor has these
                // blocks saved as well
                break;
            }
            self.save_blocks(f, need);
            let frame = &mut self.ftab[f.index()];
            frame.save |= mask;
            if f == FrameId::ROOT {
                break;
            }
            f = frame.parent;
        }
        if cfg!(debug_assertions) {
            self.check_invariants();
        }
        Ok(())
    }

    /// Restores work memory (and the pending window) to savepoint `target`.
    ///
    /// # Errors
    ///
    /// `InvalidFrame` if `target` was never saved or has been released.
    pub fn load(&mut self, target: FrameId) -> Result<()> {
        self.check_wedged()?;
        if !self.is_alive(target) {
            return Err(Error::InvalidFrame(target));
        }

        if target == self.parent {
            // fast path: undo the pending window in place
            let diff = self.diff;
            debug_assert!(self.ftab[target.index()].save.contains_all(diff));
            self.restore_blocks(target, diff);
            self.diff = BlockMask::EMPTY;
            self.framealloc.reset();
            self.handles.rollback_pending();
            tracing::debug!(frame = %target, "rolled back to cursor savepoint");
            if cfg!(debug_assertions) {
                self.check_invariants();
            }
            return Ok(());
        }

        // slow path: climb both ends to the least common ancestor,
        // deactivating (and backing up) the old branch, then replay the new
        // branch's diffs downward
        let mut restore = self.diff;
        let mut a = self.parent;
        let mut b = target;
        let mut path: SmallVec<[FrameId; 16]> = SmallVec::new();
        while a != b {
            // parent ids are strictly smaller, so always climb the higher id
            if a > b {
                let frame = &mut self.ftab[a.index()];
                frame.set_active(false);
                restore |= frame.diff;
                let parent = frame.parent;
                if frame.is_alive() || frame.children() != 0 {
                    // this frame may be revisited, directly or on the
                    // descent path to a live descendant; its un-backed diff
                    // blocks are still intact in the live work area, so save
                    // them now
                    let need = frame.diff & !frame.save;
                    if !need.is_empty() {
                        self.save_blocks(a, need);
                        self.ftab[a.index()].save |= need;
                    }
                } else {
                    self.reap(a);
                }
                a = parent;
            } else {
                path.push(b);
                b = self.ftab[b.index()].parent;
            }
        }
        let lca = a;
        // every restored block was backed up at the LCA by the write walk
        debug_assert!(self.ftab[lca.index()].save.contains_all(restore));
        self.restore_blocks(lca, restore);
        for &g in path.iter().rev() {
            let diff = self.ftab[g.index()].diff;
            debug_assert!(self.ftab[g.index()].save.contains_all(diff));
            self.restore_blocks(g, diff);
            self.ftab[g.index()].set_active(true);
        }

        self.parent = target;
        self.diff = BlockMask::EMPTY;
        self.unsaved = self.all & !self.ftab[target.index()].save;
        self.framealloc.reset();
        self.framealloc.sweep();
        self.handles.rollback_pending();
        tracing::debug!(frame = %target, lca = %lca, "rolled back across branches");
        if cfg!(debug_assertions) {
            self.check_invariants();
        }
        Ok(())
    }

    /// Drops the host's reference to savepoint `id`. The frame can no longer
    /// be loaded; its memory, save slot, and handles are reclaimed once it
    /// is off the active path and all its children are dead.
    ///
    /// # Errors
    ///
    /// `InvalidArg` for the root, `InvalidFrame` if already released.
    pub fn release(&mut self, id: FrameId) -> Result<()> {
        if id == FrameId::ROOT {
            return Err(Error::InvalidArg("cannot release the root frame"));
        }
        if !self.is_alive(id) {
            return Err(Error::InvalidFrame(id));
        }
        let frame = &mut self.ftab[id.index()];
        frame.set_alive(false);
        if frame.is_reapable() {
            self.reap(id);
        }
        Ok(())
    }

    /// Allocates frame-lifetime memory from the active frame arena. The
    /// allocation is invalidated by a rollback past the next savepoint.
    ///
    /// # Errors
    ///
    /// `InvalidArg` for a bad alignment, `OutOfMemory` if the arena cannot
    /// grow.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return Err(Error::InvalidArg("bad alignment"));
        }
        Ok(self.framealloc.alloc(size, align)?)
    }

    /// Allocates `size` zeroed bytes at the tail of the scratch buffer.
    /// Valid only within the current engine operation; the next operation
    /// that owns the scratch resets it.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the scratch cannot grow.
    pub fn tmp_alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let bytes = self.scratch.alloc(size)?;
        // Safety: slice pointers are non-null even for empty slices.
        Ok(unsafe { NonNull::new_unchecked(bytes.as_mut_ptr()) })
    }

    /// The scratch buffer (spans and delete bitmaps are accumulated here).
    #[inline]
    pub fn scratch(&mut self) -> &mut Scratch {
        &mut self.scratch
    }

    /// Issues a handle for a host-managed object. Recycled once no reachable
    /// savepoint state references it.
    pub fn new_objref(&mut self) -> ObjId {
        self.handles.issue()
    }

    /// Tears the engine down. Equivalent to dropping it; the work region
    /// stays with the caller.
    pub fn destroy(self) {
        drop(self);
    }

    // === internals ===

    fn check_wedged(&self) -> Result<()> {
        if self.wedged {
            return Err(Error::OutOfMemory);
        }
        Ok(())
    }

    /// Picks the smallest dead slot above `parent`, growing the table (and
    /// save area) if none exists.
    fn alloc_slot(&mut self, parent: FrameId) -> Result<FrameId> {
        for i in parent.index() + 1..self.ftab.len() {
            if self.ftab[i].is_unused() {
                return Ok(FrameId::from_index(i));
            }
        }
        if self.ftab.len() >= FRAME_TABLE_MAX {
            return Err(Error::OutOfMemory);
        }
        self.fsave.ensure(self.ftab.len() + 1)?;
        self.ftab.push(Frame::unused());
        Ok(FrameId::from_index(self.ftab.len() - 1))
    }

    /// Copies the masked blocks from the live work area into frame `id`'s
    /// save slot.
    fn save_blocks(&mut self, id: FrameId, mask: BlockMask) {
        tracing::trace!(frame = %id, ?mask, "saving blocks");
        let src = self.work.as_ptr().cast_const();
        let dst = self.fsave.slot(id);
        for block in mask.blocks() {
            let ofs = block as usize * self.block_size;
            // Safety: block offsets stay inside both `work_size` regions,
            // which never overlap.
            unsafe {
                core::ptr::copy_nonoverlapping(src.add(ofs), dst.add(ofs), self.block_size);
            }
        }
    }

    /// Copies the masked blocks from frame `id`'s save slot back into the
    /// live work area.
    fn restore_blocks(&mut self, id: FrameId, mask: BlockMask) {
        tracing::trace!(frame = %id, ?mask, "restoring blocks");
        let src = self.fsave.slot(id).cast_const();
        let dst = self.work.as_ptr();
        for block in mask.blocks() {
            let ofs = block as usize * self.block_size;
            // Safety: as in `save_blocks`.
            unsafe {
                core::ptr::copy_nonoverlapping(src.add(ofs), dst.add(ofs), self.block_size);
            }
        }
    }

    /// Recycles a dead frame's slot, cascading to ancestors that were
    /// already released and just lost their last child.
    fn reap(&mut self, mut id: FrameId) {
        loop {
            debug_assert!(id != FrameId::ROOT && self.ftab[id.index()].is_reapable());
            let frame = &mut self.ftab[id.index()];
            let parent = frame.parent;
            let mut objref = core::mem::take(&mut frame.objref);
            frame.alloc.reset();
            frame.alloc.sweep();
            frame.diff = BlockMask::EMPTY;
            frame.save = BlockMask::EMPTY;
            frame.state = FrameState::new();
            self.handles.release(&mut objref);
            tracing::trace!(frame = %id, "frame slot reclaimed");

            let p = &mut self.ftab[parent.index()];
            p.remove_child();
            if parent != FrameId::ROOT && p.is_reapable() {
                id = parent;
                continue;
            }
            break;
        }
    }

    /// Asserts the engine's internal invariants: the pending `unsaved` mask
    /// complements the cursor's save mask, and every frame's `diff`/`save`
    /// are subsets of its parent's `save`. Runs after every operation in
    /// debug builds; the differential tests call it directly.
    pub fn check_invariants(&self) {
        assert_eq!(
            self.unsaved,
            self.all & !self.ftab[self.parent.index()].save,
            "unsaved must complement the cursor's save mask"
        );
        assert!(self.ftab[self.parent.index()].save.contains_all(self.diff));
        for (i, frame) in self.ftab.iter().enumerate().skip(1) {
            if frame.is_unused() {
                continue;
            }
            assert!(frame.parent.index() < i, "parent id must be smaller");
            let parent_save = self.ftab[frame.parent.index()].save;
            assert!(
                parent_save.contains_all(frame.save),
                "frame save must be a subset of the parent's"
            );
            assert!(
                parent_save.contains_all(frame.diff),
                "frame diff must be a subset of the parent's save"
            );
        }
    }
}

impl core::fmt::Debug for Mem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mem")
            .field("nblocks", &self.nblocks)
            .field("block_size", &self.block_size)
            .field("parent", &self.parent)
            .field("diff", &self.diff)
            .field("frames", &self.ftab.len())
            .finish()
    }
}
