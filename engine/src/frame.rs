// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Savepoint frames.
//!
//! Frames are addressed by [`FrameId`] into a flat table; the tree is
//! implicit in `parent` back-references, which are always smaller than the
//! child id. A frame's lifecycle is packed into one [`FrameState`] word:
//! `ACTIVE` (on the path from the root to the engine's cursor), `ALIVE` (the
//! host still holds the savepoint), and the count of undead children. An
//! all-zero state is an unused slot, reusable by the next save.

use alloc::vec::Vec;
use core::fmt;

use simvat_arena::Arena;

use crate::handles::ObjId;
use crate::mask::BlockMask;

/// Index of a savepoint frame. The root frame is always id 0.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FrameId(u32);

impl FrameId {
    pub const ROOT: Self = Self(0);

    pub(crate) const fn from_index(index: usize) -> Self {
        #[expect(clippy::cast_possible_truncation, reason = "frame table is far below u32::MAX")]
        let id = index as u32;
        Self(id)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<FrameId> for u32 {
    fn from(id: FrameId) -> u32 {
        id.0
    }
}

mycelium_bitfield::bitfield! {
    /// Frame lifecycle word: `(children << 2) | alive | active`.
    #[derive(Eq, PartialEq)]
    pub(crate) struct FrameState<u32> {
        /// On the save path from the root to the engine's cursor.
        pub(crate) const ACTIVE: bool;
        /// May still be rolled into; cleared when the host drops the
        /// savepoint reference.
        pub(crate) const ALIVE: bool;
        /// Number of children that are not yet dead.
        pub(crate) const CHILDREN = ..;
    }
}

/// One savepoint record.
pub(crate) struct Frame {
    /// Blocks that changed between this frame's creation and its parent.
    pub(crate) diff: BlockMask,
    /// Blocks this frame's save slot holds a copy of.
    pub(crate) save: BlockMask,
    pub(crate) parent: FrameId,
    pub(crate) state: FrameState,
    /// Frame-lifetime allocations; reclaimed wholesale when the frame dies.
    pub(crate) alloc: Arena,
    /// Object handles issued in the window that ended at this frame's
    /// creation; recycled when the frame dies.
    pub(crate) objref: Vec<ObjId>,
}

impl Frame {
    /// An unused table slot.
    pub(crate) fn unused() -> Self {
        Self {
            diff: BlockMask::EMPTY,
            save: BlockMask::EMPTY,
            parent: FrameId::ROOT,
            state: FrameState::new(),
            alloc: Arena::new(),
            objref: Vec::new(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.get(FrameState::ACTIVE)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state.get(FrameState::ALIVE)
    }

    pub(crate) fn is_unused(&self) -> bool {
        self.state == FrameState::new()
    }

    pub(crate) fn children(&self) -> u32 {
        self.state.get(FrameState::CHILDREN)
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.state.set(FrameState::ACTIVE, active);
    }

    pub(crate) fn set_alive(&mut self, alive: bool) {
        self.state.set(FrameState::ALIVE, alive);
    }

    pub(crate) fn add_child(&mut self) {
        let children = self.children() + 1;
        self.state.set(FrameState::CHILDREN, children);
    }

    pub(crate) fn remove_child(&mut self) {
        let children = self.children();
        debug_assert!(children > 0);
        self.state.set(FrameState::CHILDREN, children - 1);
    }

    /// Dead and reusable: not referenced by the host, off the active path,
    /// no undead children.
    pub(crate) fn is_reapable(&self) -> bool {
        !self.is_alive() && !self.is_active() && self.children() == 0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("diff", &self.diff)
            .field("save", &self.save)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_word_packing() {
        let mut frame = Frame::unused();
        assert!(frame.is_unused());
        frame.set_active(true);
        frame.set_alive(true);
        assert!(frame.is_active() && frame.is_alive() && !frame.is_unused());
        frame.add_child();
        frame.add_child();
        assert_eq!(frame.children(), 2);
        frame.remove_child();
        assert_eq!(frame.children(), 1);
        assert!(frame.is_active() && frame.is_alive());
        frame.remove_child();
        frame.set_active(false);
        frame.set_alive(false);
        assert!(frame.is_unused());
        assert!(frame.is_reapable());
    }
}
