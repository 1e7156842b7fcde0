// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-shot-with-value broadcast events.
//!
//! An [`Event`] holds a flag word and an intrusive list of futures waiting
//! for the flag to change. Waiting never blocks: a waiter whose expectation
//! is already stale resolves immediately with the current flag, otherwise
//! its future is prepended to the list (the future's state word stores the
//! next link). Setting the flag detaches the whole list and completes every
//! waiter with the new value, unparking each owner.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::future::Future;
use crate::mutex::Mutex;
use crate::region;

#[repr(C)]
pub struct Event {
    waiters: AtomicPtr<Future>,
    lock: Mutex,
    flag: AtomicU32,
}

impl Event {
    #[must_use]
    pub const fn new(flag: u32) -> Self {
        Self {
            waiters: AtomicPtr::new(core::ptr::null_mut()),
            lock: Mutex::new(),
            flag: AtomicU32::new(flag),
        }
    }

    /// Current flag value.
    #[inline]
    #[must_use]
    pub fn flag(&self) -> u32 {
        self.flag.load(Ordering::Relaxed)
    }

    /// Resolves `fut` with the flag as soon as it differs from `value` —
    /// immediately if it already does, otherwise when [`set`](Self::set)
    /// changes it.
    ///
    /// # Safety
    ///
    /// `fut` must be a pending future allocated from the calling worker's
    /// region slot, alive until it resolves, and not registered anywhere
    /// else meanwhile.
    pub unsafe fn wait(&self, value: u32, fut: &Future) {
        let flag = self.flag.load(Ordering::Relaxed);
        if flag != value {
            fut.complete_local(u64::from(flag));
            return;
        }
        let guard = self.lock.lock();
        let flag = self.flag.load(Ordering::Relaxed);
        if flag != value {
            drop(guard);
            fut.complete_local(u64::from(flag));
            return;
        }
        fut.set_link(self.waiters.load(Ordering::Relaxed));
        self.waiters
            .store(core::ptr::from_ref(fut).cast_mut(), Ordering::Relaxed);
        drop(guard);
    }

    /// Stores `flag` and completes every waiter with it. Setting the
    /// current value again is a no-op.
    pub fn set(&self, flag: u32) {
        if self.flag.load(Ordering::Relaxed) == flag {
            return;
        }
        let guard = self.lock.lock();
        self.flag.store(flag, Ordering::Relaxed);
        let mut fut = self.waiters.swap(core::ptr::null_mut(), Ordering::Relaxed);
        drop(guard);
        while !fut.is_null() {
            // Safety: listed futures are valid per `wait`'s contract and
            // live in their owners' region slots.
            unsafe {
                let next = (*fut).link();
                (*fut).complete_remote(u64::from(flag));
                region::owner(fut).unpark();
                fut = next.cast_mut();
            }
        }
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Event").field("flag", &self.flag()).finish()
    }
}
