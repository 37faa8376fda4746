// Copyright (c) 2025, The Feclink Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Coding Matrix
//!
//! The unit of work of both daemons. A [`CodewordMatrix`] is the arena the
//! codec backend operates on: N symbol rows of T bytes each plus a validity
//! bit per row. A [`CodingMatrix`] wraps it with the protocol metadata that
//! drives the lifecycle Empty -> Filling -> ClearedToCodec -> ClearedToSend
//! -> flushed back to Empty.
//!
//! The arena is allocated once per pool slot and never reallocated; a flush
//! only clears validity bits and counters.

use std::net::SocketAddr;
use std::ops::Range;

use aligned_box::AlignedBox;

use crate::catalog::CodeDescriptor;
use crate::codec::{CodecOutcome, RAW_NOT_DECODED};
use crate::error::{Error, Result};
use crate::packet::LENGTH_PREFIX_LEN;
use crate::sequence::TransmitSequence;
use crate::timer::WatchdogTimer;

/// N x T symbol storage with one validity bit per row. Rows are addressed by
/// symbol index; a row becomes valid on its first write and later writes to
/// it are rejected (duplicate suppression).
pub struct CodewordMatrix {
    rows: usize,
    cols: usize,
    data: AlignedBox<[u8]>,
    valid: Vec<bool>,
}

impl CodewordMatrix {
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        let data = AlignedBox::slice_from_default(64, rows * cols)
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(CodewordMatrix {
            rows,
            cols,
            data,
            valid: vec![false; rows],
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_valid(&self, index: usize) -> bool {
        index < self.rows && self.valid[index]
    }

    pub fn row(&self, index: usize) -> &[u8] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    fn row_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.data[index * self.cols..(index + 1) * self.cols]
    }

    /// Writes one symbol, zero-padding the row to `t` bytes. Returns false
    /// without touching anything if the row is already valid. Bounds are the
    /// caller's contract; packets are validated before they get here.
    pub fn write_symbol(&mut self, index: usize, payload: &[u8], t: usize) -> bool {
        debug_assert!(index < self.rows && t <= self.cols && payload.len() <= t);
        if index >= self.rows || t > self.cols || payload.len() > t || self.valid[index] {
            return false;
        }
        let row = self.row_mut(index);
        row[..payload.len()].copy_from_slice(payload);
        row[payload.len()..t].fill(0);
        self.valid[index] = true;
        true
    }

    /// Writes a segment as an information symbol: big-endian length prefix,
    /// segment bytes, zero padding to `t`.
    pub fn write_prefixed(&mut self, index: usize, segment: &[u8], t: usize) -> bool {
        debug_assert!(segment.len() + LENGTH_PREFIX_LEN <= t);
        if segment.len() + LENGTH_PREFIX_LEN > t || index >= self.rows || self.valid[index] {
            return false;
        }
        let row = self.row_mut(index);
        row[..LENGTH_PREFIX_LEN].copy_from_slice(&(segment.len() as u16).to_be_bytes());
        row[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + segment.len()].copy_from_slice(segment);
        row[LENGTH_PREFIX_LEN + segment.len()..t].fill(0);
        self.valid[index] = true;
        true
    }

    /// Zeroes rows in `range` without marking them valid. Used before encode
    /// for information slots the sender never filled.
    pub fn fill_zero(&mut self, range: Range<usize>, t: usize) {
        for index in range {
            self.row_mut(index)[..t].fill(0);
        }
    }

    /// Marks rows in `range` valid without touching their bytes. Encode uses
    /// this after writing redundancy rows in place.
    pub fn mark_valid(&mut self, range: Range<usize>) {
        for index in range {
            self.valid[index] = true;
        }
    }

    /// Marks rows in `range` as valid all-zero symbols. Decode uses this for
    /// padding rows the sender declared but never transmitted.
    pub fn mark_padding(&mut self, range: Range<usize>, t: usize) {
        for index in range {
            if !self.valid[index] {
                self.row_mut(index)[..t].fill(0);
                self.valid[index] = true;
            }
        }
    }

    /// Validity snapshot for the first `n` rows.
    pub fn validity(&self, n: usize) -> Vec<bool> {
        self.valid[..n].to_vec()
    }

    /// Mutable row views for the first `n` rows, each `t` bytes wide.
    pub fn row_slices_mut(&mut self, n: usize, t: usize) -> Vec<&mut [u8]> {
        self.data
            .chunks_mut(self.cols)
            .take(n)
            .map(|row| &mut row[..t])
            .collect()
    }

    pub fn reset(&mut self) {
        self.valid.fill(false);
    }
}

/// Protocol state for one matrix in flight. All fields are read and written
/// only while the owning pool slot's lock is held.
pub struct CodingMatrix {
    pub engine_id: u16,
    pub matrix_id: u16,
    /// Local arrival order, monotonic across all engines.
    pub global_id: u64,
    /// How many information slots the originator actually fills (its K upper
    /// bound for this matrix).
    pub max_info_size: u16,
    pub info_count: u16,
    pub redundancy_count: u16,
    /// Symbol length in use for this matrix; at most the arena width.
    pub working_t: u16,
    pub code: Option<CodeDescriptor>,
    pub codec_status: i8,
    pub outcome: CodecOutcome,
    pub cleared_to_codec: bool,
    pub cleared_to_send: bool,
    pub feedback_requested: bool,
    pub continuous: bool,
    pub alt_mode: bool,
    /// Where this matrix's packets came from; feedback goes back there.
    pub peer: Option<SocketAddr>,
    pub timer: WatchdogTimer,
    pub sequence: TransmitSequence,
    pub(crate) occupied: bool,
    pub codeword: CodewordMatrix,
}

impl CodingMatrix {
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        Ok(CodingMatrix {
            engine_id: 0,
            matrix_id: 0,
            global_id: 0,
            max_info_size: 0,
            info_count: 0,
            redundancy_count: 0,
            working_t: 0,
            code: None,
            codec_status: RAW_NOT_DECODED,
            outcome: CodecOutcome::NotDecoded,
            cleared_to_codec: false,
            cleared_to_send: false,
            feedback_requested: false,
            continuous: false,
            alt_mode: false,
            peer: None,
            timer: WatchdogTimer::new(),
            sequence: TransmitSequence::new(),
            occupied: false,
            codeword: CodewordMatrix::new(rows, cols)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        !self.occupied
    }

    pub(crate) fn assign(&mut self, engine_id: u16, matrix_id: u16, global_id: u64) {
        self.engine_id = engine_id;
        self.matrix_id = matrix_id;
        self.global_id = global_id;
        self.occupied = true;
    }

    /// Appends a sender-side segment as the next information symbol.
    pub fn insert_info_segment(&mut self, segment: &[u8]) -> bool {
        debug_assert!(self.info_count < self.max_info_size);
        let index = self.info_count as usize;
        if !self
            .codeword
            .write_prefixed(index, segment, self.working_t as usize)
        {
            return false;
        }
        self.info_count += 1;
        true
    }

    /// Inserts a received symbol at its declared index. Returns false for a
    /// duplicate row; counters are untouched in that case.
    pub fn insert_symbol(&mut self, symbol_id: u16, payload: &[u8]) -> bool {
        let k = match self.code {
            Some(code) => code.k,
            None => return false,
        };
        if !self
            .codeword
            .write_symbol(symbol_id as usize, payload, self.working_t as usize)
        {
            return false;
        }
        if symbol_id < k {
            self.info_count += 1;
        } else {
            self.redundancy_count += 1;
        }
        true
    }

    pub fn is_info_full(&self) -> bool {
        self.max_info_size > 0 && self.info_count >= self.max_info_size
    }

    /// Returns the slot to Empty. The arena stays allocated; only validity
    /// and metadata are cleared. Invalidates the watchdog so a stale fire
    /// captured before this call can never act on the reused slot.
    pub fn reset(&mut self) {
        self.engine_id = 0;
        self.matrix_id = 0;
        self.global_id = 0;
        self.max_info_size = 0;
        self.info_count = 0;
        self.redundancy_count = 0;
        self.working_t = 0;
        self.code = None;
        self.codec_status = RAW_NOT_DECODED;
        self.outcome = CodecOutcome::NotDecoded;
        self.cleared_to_codec = false;
        self.cleared_to_send = false;
        self.feedback_requested = false;
        self.continuous = false;
        self.alt_mode = false;
        self.peer = None;
        self.timer.invalidate();
        self.sequence.clear();
        self.occupied = false;
        self.codeword.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_4x32() -> CodingMatrix {
        let mut m = CodingMatrix::new(6, 32).unwrap();
        m.assign(1, 1, 1);
        m.max_info_size = 4;
        m.working_t = 32;
        m.code = Some(CodeDescriptor {
            k: 4,
            n: 6,
            t: 32,
            continuous: false,
        });
        m
    }

    #[test]
    fn prefixed_write_roundtrips_length() {
        let mut m = matrix_4x32();
        assert!(m.insert_info_segment(b"hello"));
        let row = m.codeword.row(0);
        assert_eq!(u16::from_be_bytes([row[0], row[1]]), 5);
        assert_eq!(&row[2..7], b"hello");
        assert!(row[7..32].iter().all(|&b| b == 0));
        assert_eq!(m.info_count, 1);
    }

    #[test]
    fn duplicate_symbol_is_rejected_without_counter_change() {
        let mut m = matrix_4x32();
        assert!(m.insert_symbol(2, &[1, 2, 3]));
        assert_eq!(m.info_count, 1);
        assert!(!m.insert_symbol(2, &[9, 9, 9]));
        assert_eq!(m.info_count, 1);
        // Original bytes survive the rejected write.
        assert_eq!(&m.codeword.row(2)[..3], &[1, 2, 3]);
    }

    #[test]
    fn redundancy_symbols_count_separately() {
        let mut m = matrix_4x32();
        assert!(m.insert_symbol(0, &[1]));
        assert!(m.insert_symbol(4, &[2]));
        assert!(m.insert_symbol(5, &[3]));
        assert_eq!(m.info_count, 1);
        assert_eq!(m.redundancy_count, 2);
        assert!(!m.is_info_full());
    }

    #[test]
    fn empty_segment_is_a_valid_symbol() {
        let mut m = matrix_4x32();
        assert!(m.insert_info_segment(&[]));
        let row = m.codeword.row(0);
        assert_eq!(u16::from_be_bytes([row[0], row[1]]), 0);
        assert!(m.codeword.is_valid(0));
    }

    #[test]
    fn reset_clears_validity_and_metadata() {
        let mut m = matrix_4x32();
        m.insert_symbol(0, &[1, 2]);
        m.cleared_to_codec = true;
        let gen = m.timer.generation();
        m.reset();
        assert!(m.is_empty());
        assert!(!m.codeword.is_valid(0));
        assert_eq!(m.info_count, 0);
        assert!(!m.cleared_to_codec);
        assert!(m.code.is_none());
        assert!(m.timer.generation() > gen);
        // Slot is reusable: a fresh write works.
        assert!(m.codeword.write_symbol(0, &[7], 8));
    }

    #[test]
    fn padding_marks_rows_valid_zero() {
        let mut m = matrix_4x32();
        m.insert_symbol(0, &[0xff; 32]);
        m.codeword.mark_padding(2..4, 32);
        assert!(m.codeword.is_valid(2));
        assert!(m.codeword.is_valid(3));
        assert!(m.codeword.row(2).iter().all(|&b| b == 0));
        // Counters are codec-internal bookkeeping, not receive counts.
        assert_eq!(m.info_count, 1);
    }
}
