// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Differential test: the savepoint engine against a naive model that
//! snapshots the whole work area on every save. Random interleavings of
//! save / declare-and-mutate / load / release must agree with the model
//! byte for byte.

mod common;

use std::collections::HashMap;

use common::{BLOCK, WorkBuf, engine};
use proptest::prelude::*;

const NBLOCKS: usize = 8;
const WORK: usize = NBLOCKS * BLOCK;

#[derive(Debug, Clone)]
enum Op {
    Save,
    /// Declare and mutate the masked blocks (mask trimmed to NBLOCKS).
    Mutate(u64, u8),
    /// Load the i-th still-loadable savepoint (mod live count).
    Load(usize),
    /// Release the i-th loadable savepoint except the most recent cursor.
    Release(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => Just(Op::Save),
        4 => (any::<u64>(), any::<u8>()).prop_map(|(m, b)| Op::Mutate(m, b)),
        2 => any::<usize>().prop_map(Op::Load),
        1 => any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn engine_agrees_with_snapshot_model(ops in proptest::collection::vec(op_strategy(), 1..120)) {
        common::trace_init();
        let mut buf = WorkBuf::new();
        let mut mem = engine(&mut buf, NBLOCKS);
        let all = simvat::BlockMask::all(u32::try_from(NBLOCKS).unwrap());

        // id -> full snapshot at save time
        let mut snapshots: HashMap<simvat::FrameId, [u8; WORK]> = HashMap::new();
        let mut loadable: Vec<simvat::FrameId> = Vec::new();

        for op in ops {
            match op {
                Op::Save => {
                    let snapshot: [u8; WORK] = buf.0[..WORK].try_into().unwrap();
                    let id = mem.save().unwrap();
                    snapshots.insert(id, snapshot);
                    loadable.retain(|&f| f != id);
                    loadable.push(id);
                }
                Op::Mutate(mask, byte) => {
                    let mask = simvat::BlockMask::from_bits(mask) & all;
                    mem.write(mask).unwrap();
                    for block in mask.blocks() {
                        buf.block_mut(block as usize).fill(byte);
                    }
                }
                Op::Load(i) => {
                    if loadable.is_empty() {
                        continue;
                    }
                    let target = loadable[i % loadable.len()];
                    mem.load(target).unwrap();
                    prop_assert_eq!(&buf.0[..WORK], &snapshots[&target][..], "load({}) diverged", target);
                }
                Op::Release(i) => {
                    if loadable.len() < 2 {
                        continue;
                    }
                    // keep the current cursor loadable so the test always
                    // has a usable branch point
                    let idx = i % loadable.len();
                    let target = loadable[idx];
                    if target == mem.current() {
                        continue;
                    }
                    mem.release(target).unwrap();
                    loadable.remove(idx);
                    snapshots.remove(&target);
                }
            }
            mem.check_invariants();
        }

        // everything still loadable must restore its exact snapshot
        let survivors = loadable.clone();
        for target in survivors {
            mem.load(target).unwrap();
            prop_assert_eq!(&buf.0[..WORK], &snapshots[&target][..], "final load({}) diverged", target);
        }
    }
}
