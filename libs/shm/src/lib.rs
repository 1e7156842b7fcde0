// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared-memory coordination primitives for multi-process simulation
//! workers.
//!
//! Every participant maps one [`SharedRegion`]: a `PROC_MEMORY`-aligned slab
//! of shared address space per worker plus one global slot. Because the
//! mapping is created before workers are spawned, raw pointers into it are
//! valid in every participant, and the owner of any object can be recovered
//! from its address alone ([`region`]).
//!
//! On top of the region sit a segregated-size-class [`Heap`], futex-backed
//! [`Mutex`] and per-worker parking ([`Proc`]), one-word completion
//! [`Future`]s, bounded MPMC [`Queue`]s with direct waiter forwarding, and
//! one-shot broadcast [`Event`]s.
//!
//! All shared structures are `#[repr(C)]` with in-place atomics: their layout
//! is a wire format shared between processes.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_pointer_width = "64"))] {
        mod event;
        mod futex;
        mod future;
        mod heap;
        mod mutex;
        mod park;
        mod queue;
        pub mod region;

        pub use event::Event;
        pub use futex::Futex;
        pub use future::Future;
        pub use heap::{HEAP_MIN_CLASS, HEAP_NUM_CLASSES, Heap, Message, MsgState, Shared, WorkerHeap};
        pub use mutex::{Mutex, MutexGuard};
        pub use park::Proc;
        pub use queue::Queue;
        pub use region::{PROC_MEMORY, SharedRegion};
    } else {
        compile_error!("simvat-shm requires 64-bit linux (futex, 4 GiB process regions)");
    }
}
