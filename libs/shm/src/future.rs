// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-word completion futures.
//!
//! A [`Future`] is two words in shared memory: a state word and a payload.
//! `state == COMPLETED` (all ones) means the payload is final; any other
//! state value belongs to the primitive currently holding the future on an
//! intrusive waiter list, where it stores the address of the next waiter.
//!
//! Futures are owned by the process that allocated them (from its own worker
//! region, so waker code can find the owner by address). Only the owner may
//! read `data`; other processes complete the future with a release store and
//! unpark the owner.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) const COMPLETED: u64 = u64::MAX;

#[repr(C)]
pub struct Future {
    /// `COMPLETED`, or a waiter-list link owned by a queue/event.
    state: AtomicU64,
    /// Payload; readable by the owner once `completed()` returns true.
    data: AtomicU64,
}

// a Future must fit the smallest heap size class
static_assertions::const_assert_eq!(size_of::<Future>(), 16);
static_assertions::assert_impl_all!(Future: Send, Sync);

impl Future {
    /// A fresh pending future.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            data: AtomicU64::new(0),
        }
    }

    /// Whether the future has resolved.
    ///
    /// After this returns true the *only* additional guarantee is that
    /// [`data`](Self::data) is readable: completion by the same process uses
    /// plain stores, and completion by another process is synchronized only
    /// through this acquire load (paired with the completer's release store
    /// and the unpark edge).
    #[inline]
    #[must_use]
    pub fn completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    /// The payload. Meaningful only after [`completed`](Self::completed)
    /// returned true, and only to the owning process.
    #[inline]
    #[must_use]
    pub fn data(&self) -> u64 {
        self.data.load(Ordering::Relaxed)
    }

    /// Re-arms a resolved future for reuse.
    ///
    /// Must not be called while the future is registered on a waiter list.
    pub fn reset(&self) {
        self.state.store(0, Ordering::Relaxed);
        self.data.store(0, Ordering::Relaxed);
    }

    /// Completes with `data` on behalf of the owning process itself. No
    /// ordering is required: nobody else reads the payload.
    #[inline]
    pub(crate) fn complete_local(&self, data: u64) {
        self.data.store(data, Ordering::Relaxed);
        self.state.store(COMPLETED, Ordering::Relaxed);
    }

    /// Completes with `data` from another process. The release store on
    /// `state` is the synchronization edge the owner's acquire load pairs
    /// with; the caller must unpark the owner afterwards.
    #[inline]
    pub(crate) fn complete_remote(&self, data: u64) {
        self.data.store(data, Ordering::Relaxed);
        self.state.store(COMPLETED, Ordering::Release);
    }

    /// Completes without touching the payload (used when forwarding a free
    /// queue slot to a blocked writer, which already stored its own data).
    #[inline]
    pub(crate) fn complete_empty(&self) {
        self.state.store(COMPLETED, Ordering::Relaxed);
    }

    // waiter-list plumbing: while registered, `state` holds the address of
    // the next waiter (0 terminates the list)

    #[inline]
    pub(crate) fn set_link(&self, next: *const Future) {
        self.state.store(next.expose_provenance() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn link(&self) -> *const Future {
        #[expect(clippy::cast_possible_truncation, reason = "stores are pointer-sized")]
        let addr = self.state.load(Ordering::Relaxed) as usize;
        core::ptr::with_exposed_provenance(addr)
    }

    /// Stashes the payload before the future parks on a full-queue waiter
    /// list, so a reader can forward it.
    #[inline]
    pub(crate) fn stash_data(&self, data: u64) {
        self.data.store(data, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn stashed_data(&self) -> u64 {
        self.data.load(Ordering::Relaxed)
    }
}

impl Default for Future {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Future {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("Future")
            .field("completed", &(state == COMPLETED))
            .field("data", &self.data.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_future_is_pending() {
        let fut = Future::new();
        assert!(!fut.completed());
    }

    #[test]
    fn local_completion() {
        let fut = Future::new();
        fut.complete_local(42);
        assert!(fut.completed());
        assert_eq!(fut.data(), 42);
        fut.reset();
        assert!(!fut.completed());
    }

    #[test]
    fn link_roundtrip() {
        let a = Future::new();
        let b = Future::new();
        a.set_link(&raw const b);
        assert_eq!(a.link(), &raw const b);
        a.set_link(core::ptr::null());
        assert!(a.link().is_null());
    }
}
