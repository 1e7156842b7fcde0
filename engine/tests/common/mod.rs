// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(dead_code, reason = "shared between test binaries that use different subsets")]

use core::ptr::NonNull;

use simvat::Mem;

pub const BLOCK: usize = 64;

/// Honors `RUST_LOG` so failing runs can be replayed with engine traces.
pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Cache-line-aligned work memory: 64 blocks of 64 bytes.
#[repr(C, align(64))]
pub struct WorkBuf(pub [u8; 64 * BLOCK]);

impl WorkBuf {
    pub fn new() -> Self {
        Self([0; 64 * BLOCK])
    }

    pub fn block(&self, i: usize) -> &[u8] {
        &self.0[i * BLOCK..(i + 1) * BLOCK]
    }

    pub fn block_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.0[i * BLOCK..(i + 1) * BLOCK]
    }
}

/// An engine over the first `nblocks` blocks of `buf`.
///
/// The engine holds a raw pointer into `buf`; tests keep `buf` alive for as
/// long as the engine and mutate blocks only after declaring them.
pub fn engine(buf: &mut WorkBuf, nblocks: usize) -> Mem {
    // Safety: buf is aligned, outlives the engine in every test, and all
    // access is single-threaded.
    unsafe { Mem::new(NonNull::from(&mut buf.0).cast(), nblocks * BLOCK, BLOCK).unwrap() }
}
