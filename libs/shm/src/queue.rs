// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded multi-producer multi-consumer queues.
//!
//! The ring itself is the classic stamp-based bounded MPMC queue: each slot
//! carries a stamp that equals the head value when the slot is free for that
//! side, and the successful CAS on `read`/`write` is the linearization point
//! of the operation.
//!
//! On top of the ring sit two intrusive waiter lists, one per side, holding
//! [`Future`]s of processes that found the queue empty (readers) or full
//! (writers). A writer that reserves a slot while a reader is waiting on an
//! empty queue forwards its value straight into the reader's future and
//! advances the read head past its own write, skipping the slot round-trip
//! entirely; the read side mirrors this for blocked writers. Registration
//! races are resolved by re-checking the opposite head after publishing the
//! future and withdrawing it from the list if the queue moved.
//!
//! Queue operations never block: a future that could not complete
//! immediately resolves later, and its owner parks on its [`Proc`] until
//! unparked by the completing side.
//!
//! [`Proc`]: crate::Proc

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::future::Future;
use crate::heap::Shared;
use crate::mutex::Mutex;
use crate::region;

/// Read head. Also carries the list of *writers* waiting for space, since
/// it is readers that complete them.
#[repr(C, align(64))]
struct ReadHead {
    /// Next slot to read.
    read: AtomicU64,
    /// Capacity - 1.
    mask: u64,
    /// Writers waiting for a free slot.
    wfut: AtomicPtr<Future>,
    wfut_lock: Mutex,
}

/// Write head, with the list of waiting readers.
#[repr(C, align(64))]
struct WriteHead {
    /// Next slot to write.
    write: AtomicU64,
    /// Capacity - 1.
    mask: u64,
    /// Readers waiting for data.
    rfut: AtomicPtr<Future>,
    rfut_lock: Mutex,
}

/// One ring slot.
///
/// `stamp == n` for `n` in the write sequence means the slot is writable by
/// the writer holding ticket `n`; `stamp == n + 1` means it holds that
/// write's data and is readable by the reader with ticket `n`.
#[repr(C)]
struct Slot {
    stamp: AtomicU64,
    data: AtomicU64,
}

/// A bounded MPMC queue living in the shared heap; slots trail the header in
/// the same allocation.
#[repr(C)]
pub struct Queue {
    r: ReadHead,
    w: WriteHead,
}

static_assertions::const_assert_eq!(size_of::<Queue>(), 128);
static_assertions::const_assert_eq!(size_of::<Slot>(), 16);

impl Queue {
    /// Allocates a queue with at least `capacity` slots (rounded up to a
    /// power of two, minimum 2) from the global shared heap.
    ///
    /// Returns `None` if the shared slot is exhausted.
    pub fn new(shared: &Shared, capacity: usize) -> Option<NonNull<Queue>> {
        let cap = capacity.next_power_of_two().max(2);
        let size = size_of::<Queue>() + cap * size_of::<Slot>();
        let ptr = shared.with_heap(|heap| heap.bump(size))?;
        let queue = ptr.cast::<Queue>();
        let mask = (cap - 1) as u64;
        // Safety: fresh bump memory of `size` bytes, nobody else sees it
        // until we hand the pointer out.
        unsafe {
            queue.write(Queue {
                r: ReadHead {
                    read: AtomicU64::new(0),
                    mask,
                    wfut: AtomicPtr::new(core::ptr::null_mut()),
                    wfut_lock: Mutex::new(),
                },
                w: WriteHead {
                    write: AtomicU64::new(0),
                    mask,
                    rfut: AtomicPtr::new(core::ptr::null_mut()),
                    rfut_lock: Mutex::new(),
                },
            });
            let slots = queue.add(1).cast::<Slot>();
            for i in 0..cap {
                slots.add(i).write(Slot {
                    stamp: AtomicU64::new(i as u64),
                    data: AtomicU64::new(0),
                });
            }
        }
        Some(queue)
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        #[expect(clippy::cast_possible_truncation, reason = "capacity fits in usize")]
        let mask = self.w.mask as usize;
        mask + 1
    }

    #[inline]
    fn slot(&self, idx: u64) -> &Slot {
        debug_assert!(idx <= self.w.mask);
        #[expect(clippy::cast_possible_truncation, reason = "idx is masked below capacity")]
        let idx = idx as usize;
        // Safety: slots trail the header in the same allocation; idx is in
        // bounds.
        unsafe { &*core::ptr::from_ref(self).add(1).cast::<Slot>().add(idx) }
    }

    /// Enqueues `data`, resolving `fut` when the value has either been
    /// placed in a slot or forwarded directly to a waiting reader. If the
    /// queue is full, `fut` stays pending until a reader makes room (and
    /// then resolves with no payload).
    ///
    /// # Safety
    ///
    /// `fut` must be a pending future allocated from the calling worker's
    /// region slot, must stay alive until it resolves, and must not be
    /// registered anywhere else meanwhile.
    pub unsafe fn write(&self, data: u64, fut: &Future) {
        let mask = self.w.mask;
        'retry: loop {
            let write = self.w.write.load(Ordering::Relaxed);
            let slot = self.slot(write & mask);
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp == write {
                // the previous reader is done with this slot; try to claim it
                if self
                    .w
                    .write
                    .compare_exchange_weak(write, write + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                // no read can proceed past this slot until the stamp commits
                debug_assert!(self.r.read.load(Ordering::Relaxed) <= write);
                fut.complete_empty();
                // is a reader waiting on an empty queue? either
                //   (1) read < write: writes before ours are still in
                //       flight; one of them will complete the waiter (or it
                //       withdraws itself), so wait for the dust to settle;
                //   (2) read == write: nothing can move the read head until
                //       our stamp commits, so the slot round-trip can be
                //       skipped and the value forwarded directly.
                loop {
                    if self.w.rfut.load(Ordering::SeqCst).is_null() {
                        break;
                    }
                    let read = self.r.read.load(Ordering::Relaxed);
                    if read < write {
                        core::hint::spin_loop();
                        continue;
                    }
                    let rfut = pop_waiter(&self.w.rfut, &self.w.rfut_lock);
                    if rfut.is_null() {
                        // cleared by an earlier write before we loaded `read`
                        break;
                    }
                    // sole controller of the read head until the stamp
                    // commits below
                    self.r.read.store(write + 1, Ordering::Relaxed);
                    // plain store: the skipped slot is synchronized by the
                    // unpark edge, not the stamp
                    slot.stamp.store(write + mask + 1, Ordering::Relaxed);
                    // Safety: listed futures are valid per `read`'s
                    // contract; rfut sits in its owner's region slot.
                    unsafe {
                        (*rfut).complete_remote(data);
                        region::owner(rfut).unpark();
                    }
                    return;
                }
                // no reader was waiting: publish through the slot
                slot.data.store(data, Ordering::Relaxed);
                slot.stamp.store(write + 1, Ordering::Release);
                return;
            } else if stamp < write {
                // the queue is full: stash the value and register
                fut.stash_data(data);
                push_waiter(&self.r.wfut, &self.r.wfut_lock, fut);
                let read = self.r.read.load(Ordering::SeqCst);
                if write.wrapping_sub(read) == mask + 1 {
                    // definitely still full; whoever advances `read` sees us
                    return;
                }
                // `read` moved: either we are still listed (withdraw and
                // retry) or a reader already forwarded our value
                if unlink_waiter(&self.r.wfut, &self.r.wfut_lock, fut) {
                    continue 'retry;
                }
                return;
            } else {
                // stale ticket; another process got here first
                continue;
            }
        }
    }

    /// Dequeues a value into `fut`. If the queue is empty, `fut` stays
    /// pending until a writer supplies a value (possibly forwarding it
    /// without touching a slot).
    ///
    /// # Safety
    ///
    /// Same contract as [`write`](Self::write).
    pub unsafe fn read(&self, fut: &Future) {
        let mask = self.r.mask;
        'retry: loop {
            let read = self.r.read.load(Ordering::Relaxed);
            let slot = self.slot(read & mask);
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp == read + 1 {
                debug_assert!(read < self.w.write.load(Ordering::Relaxed));
                if self
                    .r
                    .read
                    .compare_exchange_weak(read, read + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                fut.complete_local(slot.data.load(Ordering::Relaxed));
                // symmetric to the write side: forward the freed slot to a
                // waiting writer if nothing sits between it and our read
                loop {
                    if self.r.wfut.load(Ordering::SeqCst).is_null() {
                        break;
                    }
                    let write = self.w.write.load(Ordering::Relaxed);
                    if read + mask + 1 > write {
                        core::hint::spin_loop();
                        continue;
                    }
                    let wfut = pop_waiter(&self.r.wfut, &self.r.wfut_lock);
                    if wfut.is_null() {
                        break;
                    }
                    // sole controller of the write head until the stamp
                    // commits
                    // Safety: listed futures are valid per `write`'s
                    // contract.
                    unsafe {
                        slot.data.store((*wfut).stashed_data(), Ordering::Relaxed);
                    }
                    self.w.write.store(read + mask + 2, Ordering::Relaxed);
                    // unlike the forwarding store in `write`, this one
                    // publishes slot data to future readers and needs release
                    slot.stamp.store(read + mask + 2, Ordering::Release);
                    // Safety: see above; wfut sits in its owner's slot.
                    unsafe {
                        (*wfut).complete_empty();
                        region::owner(wfut).unpark();
                    }
                    return;
                }
                // no writer was waiting: hand the slot back to the ring
                slot.stamp.store(read + mask + 1, Ordering::Release);
                return;
            } else if stamp < read + 1 {
                // the queue is empty: register
                push_waiter(&self.w.rfut, &self.w.rfut_lock, fut);
                let write = self.w.write.load(Ordering::SeqCst);
                if write == read {
                    // definitely still empty; whoever advances `write` sees us
                    return;
                }
                if unlink_waiter(&self.w.rfut, &self.w.rfut_lock, fut) {
                    continue 'retry;
                }
                return;
            } else {
                continue;
            }
        }
    }
}

// === waiter lists ===

fn pop_waiter(head: &AtomicPtr<Future>, lock: &Mutex) -> *mut Future {
    let _guard = lock.lock();
    let fut = head.load(Ordering::Relaxed);
    if !fut.is_null() {
        // Safety: listed futures are valid while registered.
        head.store(unsafe { (*fut).link() }.cast_mut(), Ordering::Relaxed);
    }
    fut
}

fn push_waiter(head: &AtomicPtr<Future>, lock: &Mutex, fut: &Future) {
    let _guard = lock.lock();
    fut.set_link(head.load(Ordering::Relaxed));
    // SeqCst: must be ordered before the opposite head re-read that decides
    // whether the queue really is still full/empty
    head.store(core::ptr::from_ref(fut).cast_mut(), Ordering::SeqCst);
}

/// Removes `fut` from the list if it is still there. `false` means some
/// other process already popped (and will complete) it.
fn unlink_waiter(head: &AtomicPtr<Future>, lock: &Mutex, fut: &Future) -> bool {
    let _guard = lock.lock();
    let target = core::ptr::from_ref(fut);
    let mut cur = head.load(Ordering::Relaxed);
    if core::ptr::eq(cur.cast_const(), target) {
        head.store(fut.link().cast_mut(), Ordering::Relaxed);
        return true;
    }
    while !cur.is_null() {
        // Safety: listed futures are valid while registered.
        let next = unsafe { (*cur).link() };
        if core::ptr::eq(next, target) {
            // Safety: see above.
            unsafe { (*cur).set_link(fut.link()) };
            return true;
        }
        cur = next.cast_mut();
    }
    false
}
