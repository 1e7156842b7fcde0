// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker parking.
//!
//! Each worker region starts with a [`Proc`] whose parking futex follows the
//! futex thread-parker protocol (the same one Rust std uses for threads,
//! lifted to processes): `EMPTY` at rest, `NOTIFIED` when an unpark arrived
//! first, `PARKED` while the owner sleeps. A stored notification makes the
//! next park return immediately, so an unpark can never be lost between the
//! completion check and the sleep.

use core::sync::atomic::Ordering;

use crate::futex::Futex;

const EMPTY: u32 = 0;
const NOTIFIED: u32 = 1;
const PARKED: u32 = u32::MAX; // EMPTY - 1

/// Per-worker shared header. Lives at the base of the worker's region slot
/// so it can be found by masking any pointer allocated there.
#[repr(C)]
pub struct Proc {
    park: Futex,
}

static_assertions::assert_eq_size!(Proc, u32);

impl Proc {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            park: Futex::new(EMPTY),
        }
    }

    /// Blocks the calling process until another process calls
    /// [`unpark`](Self::unpark).
    ///
    /// Returns immediately if a notification is already stored. Only the
    /// owning worker may park; any process may unpark.
    pub fn park(&self) {
        // EMPTY -> PARKED, or consume NOTIFIED -> EMPTY
        if self.park.value().fetch_sub(1, Ordering::Acquire) == NOTIFIED {
            return;
        }
        self.park_wait(None);
    }

    /// Like [`park`](Self::park) with a deadline `timeout_ns` nanoseconds
    /// from now (monotonic clock). Returns `true` if the wait timed out.
    pub fn park_timeout(&self, timeout_ns: u64) -> bool {
        if self.park.value().fetch_sub(1, Ordering::Acquire) == NOTIFIED {
            return false;
        }
        self.park_wait(Some(now_ns().saturating_add(timeout_ns)))
    }

    fn park_wait(&self, deadline: Option<u64>) -> bool {
        debug_assert_ne!(self.park.value().load(Ordering::Relaxed), EMPTY);
        loop {
            if let Some(deadline) = deadline {
                let left = deadline.saturating_sub(now_ns());
                if left == 0 || self.park.wait_timeout(PARKED, left) {
                    // deadline passed; un-park the word ourselves unless a
                    // notification raced in
                    if self
                        .park
                        .value()
                        .compare_exchange(PARKED, EMPTY, Ordering::Relaxed, Ordering::Relaxed)
                        .is_ok()
                    {
                        return true;
                    }
                }
            } else {
                self.park.wait(PARKED);
            }
            if self
                .park
                .value()
                .compare_exchange(NOTIFIED, EMPTY, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return false;
            }
        }
    }

    /// Wakes the owning worker if it is parked, or stores a notification
    /// that makes its next park return immediately.
    pub fn unpark(&self) {
        if self.park.value().swap(NOTIFIED, Ordering::Release) == PARKED {
            self.park.wake_one();
        }
    }
}

impl Default for Proc {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Proc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Proc").field("park", &self.park).finish()
    }
}

fn now_ns() -> u64 {
    let mut tp = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: tp is a live out-parameter.
    let r = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut tp) };
    debug_assert_eq!(r, 0);
    #[expect(clippy::cast_sign_loss, reason = "monotonic time is non-negative")]
    let (sec, nsec) = (tp.tv_sec as u64, tp.tv_nsec as u64);
    sec * 1_000_000_000 + nsec
}
