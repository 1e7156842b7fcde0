// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Columnar table editing.
//!
//! Tables are struct-of-arrays: a [`Proto`] describes the column element
//! sizes and common alignment, a [`Table`] holds the live row count, the
//! power-of-two capacity, and one base pointer per column. Columns live in
//! frame arenas, which is what makes savepoints cheap: a table persists
//! across savepoints untouched and is copied only when mutated in a newer
//! frame ([`Mem::array_mutate`]).
//!
//! Shrinking goes through span lists accumulated in the engine scratch
//! buffer: [`Mem::array_delete_bitmap`] converts a delete bitmap into the
//! complementary kept spans, then repacks every column through
//! [`Mem::array_retain_spans`]'s core.

use alloc::boxed::Box;
use alloc::vec;
use core::ptr::NonNull;

use crate::config::ARRAY_CAP0;
use crate::error::{Error, Result};
use crate::mem::Mem;

/// Column layout shared by every table using it: per-column element sizes
/// and the common alignment columns are allocated with.
#[derive(Clone, Debug)]
pub struct Proto {
    align: u32,
    sizes: Box<[u32]>,
}

impl Proto {
    /// # Errors
    ///
    /// `InvalidArg` unless `align` is a power of two covering every column
    /// element size's alignment needs, and there is at least one column.
    pub fn new(align: u32, sizes: &[u32]) -> Result<Self> {
        if !align.is_power_of_two() || align > 4096 {
            return Err(Error::InvalidArg("bad column alignment"));
        }
        if sizes.is_empty() {
            return Err(Error::InvalidArg("prototype has no columns"));
        }
        Ok(Self {
            align,
            sizes: sizes.into(),
        })
    }

    /// Single-column prototype.
    ///
    /// # Errors
    ///
    /// As [`Proto::new`].
    pub fn single(align: u32, size: u32) -> Result<Self> {
        Self::new(align, &[size])
    }

    #[inline]
    #[must_use]
    pub fn ncols(&self) -> usize {
        self.sizes.len()
    }

    #[inline]
    fn size(&self, col: usize) -> usize {
        self.sizes[col] as usize
    }
}

/// A dense columnar table. Column memory is owned by frame arenas; the
/// `Table` value itself lives wherever the host keeps it.
pub struct Table {
    num: u32,
    cap: u32,
    cols: Box<[*mut u8]>,
}

// Safety: single-owner like the engine itself; the column pointers follow
// the host's single-threaded contract.
unsafe impl Send for Table {}

impl Table {
    /// An empty table for `proto`. Nothing is allocated until the first
    /// grow.
    #[must_use]
    pub fn new(proto: &Proto) -> Self {
        Self {
            num: 0,
            cap: 0,
            cols: vec![core::ptr::null_mut(); proto.ncols()].into(),
        }
    }

    /// Logical rows.
    #[inline]
    #[must_use]
    pub fn num(&self) -> u32 {
        self.num
    }

    /// Physical row capacity.
    #[inline]
    #[must_use]
    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Base pointer of column `col`; null until the first grow.
    #[inline]
    #[must_use]
    pub fn col(&self, col: usize) -> *mut u8 {
        self.cols[col]
    }
}

impl core::fmt::Debug for Table {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Table")
            .field("num", &self.num)
            .field("cap", &self.cap)
            .field("ncols", &self.cols.len())
            .finish()
    }
}

/// A run of kept rows, accumulated in the scratch buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct Span {
    pub ofs: u32,
    pub num: u32,
}

impl Mem {
    /// Appends room for `n` rows, doubling `cap` as needed (from a floor of
    /// 4) and re-homing every column in the active frame arena. Existing
    /// rows are preserved bit-exactly.
    ///
    /// # Errors
    ///
    /// `InvalidArg` on a table/proto mismatch or capacity overflow,
    /// `OutOfMemory` if the arena cannot grow (the table is then in an
    /// unspecified but droppable state).
    pub fn array_grow(&mut self, proto: &Proto, table: &mut Table, n: u32) -> Result<()> {
        check_shape(proto, table)?;
        if n == 0 {
            return Ok(());
        }
        if table.cap == 0 {
            table.cap = ARRAY_CAP0;
        }
        let num = table.num;
        table.num = num
            .checked_add(n)
            .ok_or(Error::InvalidArg("table capacity overflow"))?;
        while table.cap < table.num {
            table.cap = table
                .cap
                .checked_mul(2)
                .ok_or(Error::InvalidArg("table capacity overflow"))?;
        }
        let cap = table.cap as usize;
        for col in 0..proto.ncols() {
            let size = proto.size(col);
            let new = self.alloc_col(proto, cap, size)?;
            let old = table.cols[col];
            if num != 0 {
                // Safety: the old column holds at least `num` rows and the
                // new one holds `cap >= num`.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        old.cast_const(),
                        new.as_ptr(),
                        num as usize * size,
                    );
                }
            }
            table.cols[col] = new.as_ptr();
        }
        Ok(())
    }

    /// Makes every column writable in the current frame: any column whose
    /// base is not in the active arena's current chunk is copied there
    /// first. Tables persist across savepoints for free and diverge only
    /// when mutated after a save.
    ///
    /// # Errors
    ///
    /// As [`array_grow`](Self::array_grow).
    pub fn array_mutate(&mut self, proto: &Proto, table: &mut Table) -> Result<()> {
        check_shape(proto, table)?;
        let num = table.num as usize;
        let cap = table.cap as usize;
        for col in 0..proto.ncols() {
            let old = table.cols[col];
            if self.framealloc.contains(old) {
                continue;
            }
            let size = proto.size(col);
            let new = self.alloc_col(proto, cap, size)?;
            if num != 0 {
                // Safety: the old column holds `num` rows; the copy targets
                // a fresh allocation of `cap >= num` rows.
                unsafe {
                    core::ptr::copy_nonoverlapping(old.cast_const(), new.as_ptr(), num * size);
                }
            }
            table.cols[col] = new.as_ptr();
        }
        Ok(())
    }

    /// Repacks the table to exactly the rows covered by the spans previously
    /// pushed onto the scratch buffer (in span order), shrinking `cap` by
    /// halving while `cap / 2 >= nremain`. `nremain` must be the row total
    /// of the spans; zero releases the table. Resets the scratch.
    ///
    /// # Errors
    ///
    /// As [`array_grow`](Self::array_grow).
    pub fn array_retain_spans(&mut self, proto: &Proto, table: &mut Table, nremain: u32) -> Result<()> {
        let nspan = self.scratch.len() / size_of::<Span>();
        self.retain_spans_at(proto, table, 0, nspan, nremain)
    }

    /// Deletes the rows whose bits are set in the bitmap previously written
    /// to the start of the scratch buffer (`(num >> 6) + 1` words; bits at
    /// and past `num` are ignored). Converts the zero runs into kept spans
    /// and repacks. Resets the scratch.
    ///
    /// # Errors
    ///
    /// `InvalidArg` if the scratch holds fewer bitmap words than the row
    /// count needs; otherwise as [`array_grow`](Self::array_grow).
    pub fn array_delete_bitmap(&mut self, proto: &Proto, table: &mut Table) -> Result<()> {
        check_shape(proto, table)?;
        let num = table.num;
        let nwords = (num as usize >> 6) + 1;
        if self.scratch.len() < nwords * 8 {
            return Err(Error::InvalidArg("delete bitmap too short"));
        }
        // terminate the last kept run: everything at and past `num` reads as
        // deleted
        let last_ofs = (num as usize >> 6) * 8;
        let last = self.scratch.read::<u64>(last_ofs) | (!0u64 << (num & 63));
        self.scratch.write(last_ofs, last);

        let spans_ofs = self.scratch.len();
        let mut start: u32 = 0;
        let mut nremain: u32 = 0;
        for w in 0..nwords {
            let mut word = self.scratch.read::<u64>(w * 8);
            #[expect(clippy::cast_possible_truncation, reason = "bit index of a <=2^32-bit bitmap")]
            let mut ofs = (w as u32) * 64;
            while word != 0 {
                // next deleted bit closes the kept run that started at
                // `start` (possibly empty)
                let bit = word.trailing_zeros();
                let end = ofs + bit;
                if end > start {
                    let n = end - start;
                    self.scratch.push(Span { ofs: start, num: n })?;
                    nremain += n;
                }
                // shift one extra so the complement below is never zero
                word = word >> bit >> 1;
                let skip = (!word).trailing_zeros();
                ofs += bit + 1 + skip;
                start = ofs;
                word >>= skip;
            }
        }
        let nspan = (self.scratch.len() - spans_ofs) / size_of::<Span>();
        self.retain_spans_at(proto, table, spans_ofs, nspan, nremain)
    }

    fn retain_spans_at(
        &mut self,
        proto: &Proto,
        table: &mut Table,
        spans_ofs: usize,
        nspan: usize,
        nremain: u32,
    ) -> Result<()> {
        check_shape(proto, table)?;
        if nspan == 0 || nremain == 0 {
            table.num = 0;
            table.cap = 0;
            self.scratch.clear();
            return Ok(());
        }
        debug_assert!(nremain <= table.num);
        table.num = nremain;
        while table.cap >> 1 >= nremain {
            table.cap >>= 1;
        }
        let cap = table.cap as usize;
        for col in 0..proto.ncols() {
            let size = proto.size(col);
            let new = self.alloc_col(proto, cap, size)?;
            let old = table.cols[col];
            let mut out = new.as_ptr();
            for i in 0..nspan {
                let span: Span = self.scratch.read(spans_ofs + i * size_of::<Span>());
                let bytes = span.num as usize * size;
                // Safety: spans address rows below the old `num <= cap` and
                // the outputs sum to `nremain <= cap` rows.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        old.add(span.ofs as usize * size).cast_const(),
                        out,
                        bytes,
                    );
                    out = out.add(bytes);
                }
            }
            table.cols[col] = new.as_ptr();
        }
        self.scratch.clear();
        Ok(())
    }

    fn alloc_col(&mut self, proto: &Proto, cap: usize, size: usize) -> Result<NonNull<u8>> {
        let bytes = cap.checked_mul(size).ok_or(Error::OutOfMemory)?;
        Ok(self.framealloc.alloc(bytes, proto.align as usize)?)
    }
}

fn check_shape(proto: &Proto, table: &Table) -> Result<()> {
    if proto.ncols() != table.cols.len() {
        return Err(Error::InvalidArg("table does not match prototype"));
    }
    Ok(())
}
