// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Columnar table editing: grow, copy-on-mutate, span retention, bitmap
//! deletion.

mod common;

use common::{WorkBuf, engine};
use proptest::prelude::*;
use simvat::{Mem, Proto, Span, Table};

/// Reads column `col` of `table` as typed values.
fn col_values<T: Copy>(table: &Table, col: usize, n: usize) -> Vec<T> {
    // Safety: tests only read back rows they wrote.
    unsafe { core::slice::from_raw_parts(table.col(col).cast::<T>(), n).to_vec() }
}

/// Writes `values` into column `col`.
fn fill_col<T: Copy>(table: &Table, col: usize, values: &[T]) {
    // Safety: the column has capacity for `values.len()` rows.
    unsafe {
        core::ptr::copy_nonoverlapping(values.as_ptr(), table.col(col).cast::<T>(), values.len());
    }
}

/// Writes a delete bitmap for `dels` into the scratch buffer.
fn push_bitmap(mem: &mut Mem, dels: &[bool]) {
    let nwords = (dels.len() >> 6) + 1;
    let mut words = vec![0u64; nwords];
    for (i, &del) in dels.iter().enumerate() {
        if del {
            words[i >> 6] |= 1 << (i & 63);
        }
    }
    for word in words {
        mem.scratch().push(word).unwrap();
    }
}

#[test]
fn grow_and_delete_bitmap() {
    // delete rows 1 and 3 of [10, 20, 30, 40, 50]
    let mut buf = WorkBuf::new();
    let mut mem = engine(&mut buf, 4);
    let proto = Proto::single(4, 4).unwrap();
    let mut table = Table::new(&proto);

    mem.array_grow(&proto, &mut table, 5).unwrap();
    assert_eq!(table.num(), 5);
    assert_eq!(table.cap(), 8);
    fill_col(&table, 0, &[10u32, 20, 30, 40, 50]);

    push_bitmap(&mut mem, &[false, true, false, true, false]);
    mem.array_delete_bitmap(&proto, &mut table).unwrap();
    assert_eq!(table.num(), 3);
    assert_eq!(col_values::<u32>(&table, 0, 3), [10, 30, 50]);
    assert_eq!(mem.scratch().len(), 0, "the operation owns and resets the scratch");
}

#[test]
fn grow_preserves_existing_rows() {
    // existing rows survive bit-exactly across several capacity doublings
    let mut buf = WorkBuf::new();
    let mut mem = engine(&mut buf, 4);
    let proto = Proto::single(8, 8).unwrap();
    let mut table = Table::new(&proto);

    mem.array_grow(&proto, &mut table, 5).unwrap();
    let first: Vec<u64> = (0..5).map(|i| i * 1000 + 7).collect();
    fill_col(&table, 0, &first);

    mem.array_grow(&proto, &mut table, 100).unwrap();
    assert_eq!(table.num(), 105);
    assert_eq!(table.cap(), 128);
    assert_eq!(col_values::<u64>(&table, 0, 5), first);
}

#[test]
fn retain_spans_in_span_order() {
    // the result is the concatenation of the spans, in span order
    let mut buf = WorkBuf::new();
    let mut mem = engine(&mut buf, 4);
    let proto = Proto::single(4, 4).unwrap();
    let mut table = Table::new(&proto);

    mem.array_grow(&proto, &mut table, 10).unwrap();
    let rows: Vec<u32> = (0..10).collect();
    fill_col(&table, 0, &rows);

    mem.scratch().push(Span { ofs: 6, num: 2 }).unwrap();
    mem.scratch().push(Span { ofs: 0, num: 3 }).unwrap();
    mem.array_retain_spans(&proto, &mut table, 5).unwrap();

    assert_eq!(table.num(), 5);
    assert_eq!(table.cap(), 8, "16 halves once; 8/2 < 5");
    assert_eq!(col_values::<u32>(&table, 0, 5), [6, 7, 0, 1, 2]);
}

#[test]
fn retain_nothing_releases_the_table() {
    let mut buf = WorkBuf::new();
    let mut mem = engine(&mut buf, 4);
    let proto = Proto::single(4, 4).unwrap();
    let mut table = Table::new(&proto);

    mem.array_grow(&proto, &mut table, 8).unwrap();
    mem.array_retain_spans(&proto, &mut table, 0).unwrap();
    assert_eq!(table.num(), 0);
    assert_eq!(table.cap(), 0);

    // a released table grows again from the initial capacity
    mem.array_grow(&proto, &mut table, 1).unwrap();
    assert_eq!(table.cap(), 4);
}

#[test]
fn delete_all_rows() {
    let mut buf = WorkBuf::new();
    let mut mem = engine(&mut buf, 4);
    let proto = Proto::single(4, 4).unwrap();
    let mut table = Table::new(&proto);

    mem.array_grow(&proto, &mut table, 70).unwrap();
    push_bitmap(&mut mem, &[true; 70]);
    mem.array_delete_bitmap(&proto, &mut table).unwrap();
    assert_eq!(table.num(), 0);
    assert_eq!(table.cap(), 0);
}

#[test]
fn multi_column_delete_keeps_columns_parallel() {
    let mut buf = WorkBuf::new();
    let mut mem = engine(&mut buf, 4);
    let proto = Proto::new(8, &[1, 4, 8]).unwrap();
    let mut table = Table::new(&proto);

    mem.array_grow(&proto, &mut table, 9).unwrap();
    let bytes: Vec<u8> = (10..19).collect();
    let ints: Vec<u32> = (100..109).collect();
    let longs: Vec<u64> = (1000..1009).collect();
    fill_col(&table, 0, &bytes);
    fill_col(&table, 1, &ints);
    fill_col(&table, 2, &longs);

    // keep every third row
    let dels: Vec<bool> = (0..9).map(|i| i % 3 != 0).collect();
    push_bitmap(&mut mem, &dels);
    mem.array_delete_bitmap(&proto, &mut table).unwrap();

    assert_eq!(table.num(), 3);
    assert_eq!(col_values::<u8>(&table, 0, 3), [10, 13, 16]);
    assert_eq!(col_values::<u32>(&table, 1, 3), [100, 103, 106]);
    assert_eq!(col_values::<u64>(&table, 2, 3), [1000, 1003, 1006]);
}

#[test]
fn mutate_copies_columns_out_of_older_frames() {
    let mut buf = WorkBuf::new();
    let mut mem = engine(&mut buf, 4);
    let proto = Proto::single(4, 4).unwrap();
    let mut table = Table::new(&proto);

    mem.array_grow(&proto, &mut table, 3).unwrap();
    fill_col(&table, 0, &[1u32, 2, 3]);
    let before = table.col(0);

    // the save hands the column's arena to the new frame; the first mutate
    // afterwards must re-home the column into the fresh window
    mem.save().unwrap();
    mem.array_mutate(&proto, &mut table).unwrap();
    let after = table.col(0);
    assert_ne!(before, after);
    assert_eq!(col_values::<u32>(&table, 0, 3), [1, 2, 3]);

    // already writable: a second mutate is a no-op
    mem.array_mutate(&proto, &mut table).unwrap();
    assert_eq!(table.col(0), after);
}

proptest! {
    // deleting by bitmap equals the naive per-row filter
    #[test]
    fn delete_bitmap_equals_naive_filter(rows in proptest::collection::vec((any::<u32>(), any::<bool>()), 1..200)) {
        let mut buf = WorkBuf::new();
        let mut mem = engine(&mut buf, 4);
        let proto = Proto::single(4, 4).unwrap();
        let mut table = Table::new(&proto);

        let values: Vec<u32> = rows.iter().map(|&(v, _)| v).collect();
        let dels: Vec<bool> = rows.iter().map(|&(_, d)| d).collect();
        let n = u32::try_from(values.len()).unwrap();
        mem.array_grow(&proto, &mut table, n).unwrap();
        fill_col(&table, 0, &values);

        push_bitmap(&mut mem, &dels);
        mem.array_delete_bitmap(&proto, &mut table).unwrap();

        let expect: Vec<u32> = values
            .iter()
            .zip(&dels)
            .filter_map(|(&v, &d)| (!d).then_some(v))
            .collect();
        prop_assert_eq!(table.num() as usize, expect.len());
        prop_assert_eq!(col_values::<u32>(&table, 0, expect.len()), expect);
    }
}
