// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A futex-backed mutex usable from any process sharing the mapping.
//!
//! Tri-state protocol (the classic futex mutex, as in Rust std's unix
//! locks): `UNLOCKED` → `LOCKED` on the uncontended fast path; a waiter that
//! runs out of spins parks the word at `CONTENDED` so the unlocker knows a
//! futex wake is needed.
//!
//! The mutex carries no data: it guards sibling fields of the shared
//! structure that embeds it (heap, waiter lists). [`lock_api::RawMutex`] is
//! implemented for use with `lock_api` wrappers where the guarded data is
//! process-private.

use core::sync::atomic::Ordering;

use crate::futex::Futex;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const SPIN_LIMIT: u32 = 100;

/// A tri-state futex mutex, 4 bytes, `#[repr(C)]`-embeddable in shared
/// structures. Zero-initialized memory is a valid unlocked mutex.
#[repr(transparent)]
pub struct Mutex {
    state: Futex,
}

static_assertions::assert_eq_size!(Mutex, u32);

/// Unlocks the mutex on drop.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

// === impl Mutex ===

impl Mutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Futex::new(UNLOCKED),
        }
    }

    /// Acquires the mutex, blocking the calling process if necessary.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_> {
        if self
            .state
            .value()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        MutexGuard { mutex: self }
    }

    /// Attempts to acquire the mutex without blocking.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        self.state
            .value()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then_some(MutexGuard { mutex: self })
    }

    #[cold]
    fn lock_contended(&self) {
        // spin while the owner looks short-lived (word stays LOCKED)
        let mut value = self.state.value().load(Ordering::Relaxed);
        for _ in 0..SPIN_LIMIT {
            value = self.state.value().load(Ordering::Relaxed);
            if value != LOCKED {
                break;
            }
            core::hint::spin_loop();
        }
        if value == UNLOCKED
            && self
                .state
                .value()
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
        loop {
            if self.state.value().swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            self.state.wait(CONTENDED);
        }
    }

    /// Releases the mutex.
    ///
    /// # Safety
    ///
    /// The calling process must logically hold the lock (a guard was
    /// forgotten, or the caller is implementing its own guard).
    #[inline]
    pub unsafe fn force_unlock(&self) {
        if self.state.value().swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.state.wake_one();
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex").field("state", &self.state).finish()
    }
}

// Safety: the whole point; all state transitions go through atomics and the
// futex syscall.
unsafe impl Send for Mutex {}
// Safety: see above.
unsafe impl Sync for Mutex {}

// === impl MutexGuard ===

impl Drop for MutexGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        // Safety: a MutexGuard always holds the lock.
        unsafe { self.mutex.force_unlock() }
    }
}

// === lock_api ===

// Safety: lock()/force_unlock() implement mutual exclusion as required.
unsafe impl lock_api::RawMutex for Mutex {
    #[allow(clippy::declare_interior_mutable_const, reason = "lock_api requires an INIT value")]
    const INIT: Self = Mutex::new();
    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        core::mem::forget(Mutex::lock(self));
    }

    fn try_lock(&self) -> bool {
        let guard = Mutex::try_lock(self);
        let ret = guard.is_some();
        core::mem::forget(guard);
        ret
    }

    unsafe fn unlock(&self) {
        // Safety: ensured by caller.
        unsafe { Mutex::force_unlock(self) }
    }
}
