// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin wrapper over the `futex(2)` syscall.
//!
//! The word lives in shared memory, so the cross-process (non-`PRIVATE`)
//! futex ops are used throughout.

use core::sync::atomic::AtomicU32;

/// A 32-bit word any process sharing the mapping may sleep on or wake.
#[repr(transparent)]
pub struct Futex(AtomicU32);

static_assertions::assert_eq_size!(Futex, u32);

impl Futex {
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    /// The raw atomic word.
    #[inline]
    pub fn value(&self) -> &AtomicU32 {
        &self.0
    }

    /// Blocks until woken while the word equals `expected`.
    ///
    /// Returns immediately if the word differs. Signal interruptions are
    /// treated as spurious wake-ups; callers re-check their condition in a
    /// loop anyway.
    pub fn wait(&self, expected: u32) {
        self.wait_inner(expected, core::ptr::null());
    }

    /// Like [`wait`](Self::wait) with a relative timeout.
    ///
    /// Returns `true` if the timeout elapsed before a wake.
    pub fn wait_timeout(&self, expected: u32, timeout_ns: u64) -> bool {
        #[expect(clippy::cast_possible_wrap, reason = "nanoseconds below one second")]
        let timeout = libc::timespec {
            tv_sec: i64::try_from(timeout_ns / 1_000_000_000).unwrap_or(i64::MAX),
            tv_nsec: (timeout_ns % 1_000_000_000) as i64,
        };
        self.wait_inner(expected, &raw const timeout)
    }

    fn wait_inner(&self, expected: u32, timeout: *const libc::timespec) -> bool {
        // Safety: the futex word outlives the syscall; timeout is null or a
        // live timespec.
        let r = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.0.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                timeout,
            )
        };
        if r == 0 {
            return false;
        }
        // Safety: errno read on the calling thread right after the failure.
        match unsafe { *libc::__errno_location() } {
            // value changed under us, interrupted, or spurious: not a timeout
            libc::EAGAIN | libc::EINTR => false,
            libc::ETIMEDOUT => true,
            errno => panic!("futex_wait failed: errno {errno}"),
        }
    }

    /// Wakes up to `n` waiters.
    pub fn wake(&self, n: i32) {
        // Safety: the futex word outlives the syscall.
        let r = unsafe { libc::syscall(libc::SYS_futex, self.0.as_ptr(), libc::FUTEX_WAKE, n) };
        assert!(r >= 0, "futex_wake failed");
    }

    #[inline]
    pub fn wake_one(&self) {
        self.wake(1);
    }

    #[inline]
    pub fn wake_all(&self) {
        self.wake(i32::MAX);
    }
}

impl core::fmt::Debug for Futex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Futex")
            .field(&self.0.load(core::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}
