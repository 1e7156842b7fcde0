// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Object-handle recycling.
//!
//! Handles identify host-managed external objects; the engine only tracks
//! which ones are in circulation. Every handle issued since the last
//! savepoint sits on the pending list. A save freezes the pending list into
//! the new frame's `objref`; a load returns it to the free pool (the
//! rolled-back window can no longer reference those objects); a dying frame
//! returns its `objref` the same way. A handle is therefore in exactly one
//! place — free pool, pending list, or one frame's `objref` — and can never
//! be issued twice while reachable.

use alloc::vec::Vec;
use core::fmt;

/// Dense identifier for a host-managed external object. Handle 0 is
/// reserved for "nil" and never issued.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(transparent)]
pub struct ObjId(u32);

impl ObjId {
    pub const NIL: Self = Self(0);
}

impl From<ObjId> for u32 {
    fn from(id: ObjId) -> u32 {
        id.0
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

pub(crate) struct Handles {
    /// Recycled handles, reused before fresh ones are minted.
    pool: Vec<ObjId>,
    /// Handles issued since the last savepoint.
    pending: Vec<ObjId>,
    /// Next never-issued handle.
    next: u32,
}

impl Handles {
    pub(crate) const fn new() -> Self {
        Self {
            pool: Vec::new(),
            pending: Vec::new(),
            next: 1,
        }
    }

    /// Issues a handle, preferring the recycle pool.
    pub(crate) fn issue(&mut self) -> ObjId {
        let handle = self.pool.pop().unwrap_or_else(|| {
            let handle = ObjId(self.next);
            self.next = self.next.checked_add(1).expect("object handle space exhausted");
            handle
        });
        self.pending.push(handle);
        handle
    }

    /// Hands the pending window over to a freshly created frame.
    pub(crate) fn freeze_pending(&mut self) -> Vec<ObjId> {
        core::mem::take(&mut self.pending)
    }

    /// Rolls the pending window back: its handles reference objects that no
    /// longer exist in the restored state, so they go back into circulation.
    pub(crate) fn rollback_pending(&mut self) {
        self.pool.append(&mut self.pending);
    }

    /// Recycles a dead frame's handles.
    pub(crate) fn release(&mut self, objref: &mut Vec<ObjId>) {
        self.pool.append(objref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_dense_from_one() {
        let mut handles = Handles::new();
        assert_eq!(u32::from(handles.issue()), 1);
        assert_eq!(u32::from(handles.issue()), 2);
    }

    #[test]
    fn rolled_back_window_is_recycled() {
        let mut handles = Handles::new();
        let h1 = handles.issue();
        let frozen = handles.freeze_pending();
        assert_eq!(frozen, [h1]);

        let h2 = handles.issue();
        handles.rollback_pending();
        // the recycled handle is issued again before any fresh one
        assert_eq!(handles.issue(), h2);
        assert_eq!(u32::from(handles.issue()), 3);
    }

    #[test]
    fn dead_frame_handles_return_to_pool() {
        let mut handles = Handles::new();
        let h1 = handles.issue();
        let h2 = handles.issue();
        let mut objref = handles.freeze_pending();
        assert_eq!(objref, [h1, h2]);
        handles.release(&mut objref);
        assert!(objref.is_empty());
        assert_eq!(handles.issue(), h2);
        assert_eq!(handles.issue(), h1);
    }
}
