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

//! # Codec Backends
//!
//! The erasure-code math lives behind the [`CodecBackend`] trait; the
//! pipeline only depends on the three-value generic outcome. Two production
//! backends wrap the `reed-solomon-erasure` Galois fields (GF(2^8) for
//! small matrices, GF(2^16) for large coding windows); [`NullCodec`] is the
//! always-succeeds double used to exercise the pipeline without real math.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use reed_solomon_erasure::{galois_16, galois_8};

use crate::catalog::CodeDescriptor;
use crate::error::{Error, Result};
use crate::matrix::CodewordMatrix;

/// Raw status convention shared by the bundled backends. The wire carries
/// the raw i8; only the generic mapping below is contractual.
pub const RAW_NOT_DECODED: i8 = 0;
pub const RAW_SUCCESS: i8 = 1;
pub const RAW_FAILED: i8 = -1;

/// Generic decode/encode outcome the pipeline and the upper protocol see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecOutcome {
    NotDecoded,
    Success,
    Failed,
}

impl fmt::Display for CodecOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecOutcome::NotDecoded => write!(f, "not decoded"),
            CodecOutcome::Success => write!(f, "success"),
            CodecOutcome::Failed => write!(f, "failed"),
        }
    }
}

pub trait CodecBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// The (K, N, T) triples this backend offers for adaptive catalogs at
    /// the given symbol length, sorted by (K, N).
    fn supported_codes(&self, symbol_len: u16) -> Vec<CodeDescriptor>;

    /// Whether an arbitrary code (typically a fixed configuration) is
    /// usable with this backend.
    fn supports_code(&self, code: &CodeDescriptor) -> bool;

    /// Fills redundancy rows [K, N) from information rows [0, K). Rows the
    /// caller never filled must already be zeroed.
    fn encode(&self, matrix: &mut CodewordMatrix, code: &CodeDescriptor) -> i8;

    /// Reconstructs missing rows. `padding` names information rows the
    /// originator declared but never transmitted; they are known all-zero
    /// and are marked valid before reconstruction.
    fn decode(&self, matrix: &mut CodewordMatrix, code: &CodeDescriptor, padding: Range<u16>)
        -> i8;

    fn status_to_generic(&self, status: i8) -> CodecOutcome;

    fn status_to_string(&self, status: i8) -> &'static str;

    fn supports_continuous_mode(&self) -> bool;

    /// Smallest redundancy window this backend can code over; the catalog's
    /// continuous margin must clear it.
    fn min_coding_window(&self) -> u16;
}

/// Selects a backend from its configuration name.
pub fn backend_by_name(name: &str) -> Result<Arc<dyn CodecBackend>> {
    match name {
        "rs8" => Ok(Arc::new(ReedSolomon8::new())),
        "rs16" => Ok(Arc::new(ReedSolomon16::new())),
        "null" => Ok(Arc::new(NullCodec::new())),
        other => Err(Error::Config(format!("unknown codec backend '{other}'"))),
    }
}

fn generic_of_raw(status: i8) -> CodecOutcome {
    if status == RAW_NOT_DECODED {
        CodecOutcome::NotDecoded
    } else if status > 0 {
        CodecOutcome::Success
    } else {
        CodecOutcome::Failed
    }
}

/// Ladder of (K, parity) pairs used by the bundled backends: for each K,
/// parities of K/4, K/2 and K give code rates 0.8, 0.67 and 0.5.
fn ladder(ks: &[u16], symbol_len: u16, max_shards: u32) -> Vec<CodeDescriptor> {
    let mut codes = Vec::new();
    for &k in ks {
        for parity in [k / 4, k / 2, k] {
            if parity == 0 {
                continue;
            }
            let n = k as u32 + parity as u32;
            if n <= max_shards {
                codes.push(CodeDescriptor {
                    k,
                    n: n as u16,
                    t: symbol_len,
                    continuous: false,
                });
            }
        }
    }
    codes.sort_by_key(|c| (c.k, c.n));
    codes.dedup_by_key(|c| (c.k, c.n));
    codes
}

// ---------------------------------------------------------------------------
// GF(2^8) backend
// ---------------------------------------------------------------------------

const GF8_MAX_SHARDS: u32 = 256;

pub struct ReedSolomon8 {
    cache: Mutex<HashMap<(u16, u16), Arc<galois_8::ReedSolomon>>>,
}

impl ReedSolomon8 {
    pub fn new() -> Self {
        ReedSolomon8 {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn instance(
        &self,
        k: u16,
        parity: u16,
    ) -> std::result::Result<Arc<galois_8::ReedSolomon>, reed_solomon_erasure::Error> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(rs) = cache.get(&(k, parity)) {
            return Ok(rs.clone());
        }
        let rs = Arc::new(galois_8::ReedSolomon::new(k as usize, parity as usize)?);
        cache.insert((k, parity), rs.clone());
        Ok(rs)
    }
}

impl Default for ReedSolomon8 {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecBackend for ReedSolomon8 {
    fn name(&self) -> &'static str {
        "rs8"
    }

    fn supported_codes(&self, symbol_len: u16) -> Vec<CodeDescriptor> {
        ladder(&[4, 8, 16, 32, 64], symbol_len, GF8_MAX_SHARDS)
    }

    fn supports_code(&self, code: &CodeDescriptor) -> bool {
        code.k >= 1 && code.k < code.n && (code.n as u32) <= GF8_MAX_SHARDS && code.t >= 3
    }

    fn encode(&self, matrix: &mut CodewordMatrix, code: &CodeDescriptor) -> i8 {
        let k = code.k as usize;
        let n = code.n as usize;
        let t = code.t as usize;
        let rs = match self.instance(code.k, code.parity()) {
            Ok(rs) => rs,
            Err(e) => {
                warn!("rs8: cannot build K={} N={} coder: {e}", code.k, code.n);
                return RAW_FAILED;
            }
        };
        let mut rows = matrix.row_slices_mut(n, t);
        let (data, parity) = rows.split_at_mut(k);
        if let Err(e) = rs.encode_sep(&data[..], parity) {
            warn!("rs8: encode K={} N={} failed: {e}", code.k, code.n);
            return RAW_FAILED;
        }
        matrix.mark_valid(k..n);
        RAW_SUCCESS
    }

    fn decode(
        &self,
        matrix: &mut CodewordMatrix,
        code: &CodeDescriptor,
        padding: Range<u16>,
    ) -> i8 {
        reconstruct_data_rows(matrix, code, padding, |shards| {
            self.instance(code.k, code.parity())?.reconstruct_data(shards)
        })
    }

    fn status_to_generic(&self, status: i8) -> CodecOutcome {
        generic_of_raw(status)
    }

    fn status_to_string(&self, status: i8) -> &'static str {
        match generic_of_raw(status) {
            CodecOutcome::NotDecoded => "rs8: not decoded",
            CodecOutcome::Success => "rs8: success",
            CodecOutcome::Failed => "rs8: reconstruction failed",
        }
    }

    fn supports_continuous_mode(&self) -> bool {
        true
    }

    fn min_coding_window(&self) -> u16 {
        2
    }
}

// ---------------------------------------------------------------------------
// GF(2^16) backend
// ---------------------------------------------------------------------------

const GF16_MAX_SHARDS: u32 = 65536;

pub struct ReedSolomon16 {
    cache: Mutex<HashMap<(u16, u16), Arc<galois_16::ReedSolomon>>>,
}

impl ReedSolomon16 {
    pub fn new() -> Self {
        ReedSolomon16 {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn instance(
        &self,
        k: u16,
        parity: u16,
    ) -> std::result::Result<Arc<galois_16::ReedSolomon>, reed_solomon_erasure::Error> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(rs) = cache.get(&(k, parity)) {
            return Ok(rs.clone());
        }
        let rs = Arc::new(galois_16::ReedSolomon::new(k as usize, parity as usize)?);
        cache.insert((k, parity), rs.clone());
        Ok(rs)
    }
}

impl Default for ReedSolomon16 {
    fn default() -> Self {
        Self::new()
    }
}

// The GF(2^16) element is a byte pair, so rows are staged through pair
// buffers around each coder call.
fn pairs_of(row: &[u8]) -> Vec<[u8; 2]> {
    row.chunks_exact(2).map(|c| [c[0], c[1]]).collect()
}

fn write_pairs(row: &mut [u8], pairs: &[[u8; 2]]) {
    for (chunk, pair) in row.chunks_exact_mut(2).zip(pairs) {
        chunk.copy_from_slice(pair);
    }
}

impl CodecBackend for ReedSolomon16 {
    fn name(&self) -> &'static str {
        "rs16"
    }

    fn supported_codes(&self, symbol_len: u16) -> Vec<CodeDescriptor> {
        // GF(2^16) symbols are 2 bytes; odd widths cannot be coded.
        if symbol_len % 2 != 0 {
            return Vec::new();
        }
        ladder(&[64, 128, 256, 512], symbol_len, GF16_MAX_SHARDS)
    }

    fn supports_code(&self, code: &CodeDescriptor) -> bool {
        code.k >= 1
            && code.k < code.n
            && (code.n as u32) <= GF16_MAX_SHARDS
            && code.t >= 4
            && code.t % 2 == 0
    }

    fn encode(&self, matrix: &mut CodewordMatrix, code: &CodeDescriptor) -> i8 {
        let k = code.k as usize;
        let n = code.n as usize;
        let t = code.t as usize;
        let rs = match self.instance(code.k, code.parity()) {
            Ok(rs) => rs,
            Err(e) => {
                warn!("rs16: cannot build K={} N={} coder: {e}", code.k, code.n);
                return RAW_FAILED;
            }
        };
        let data: Vec<Vec<[u8; 2]>> =
            (0..k).map(|i| pairs_of(&matrix.row(i)[..t])).collect();
        let mut parity = vec![vec![[0u8; 2]; t / 2]; n - k];
        if let Err(e) = rs.encode_sep(&data, &mut parity) {
            warn!("rs16: encode K={} N={} failed: {e}", code.k, code.n);
            return RAW_FAILED;
        }
        let mut rows = matrix.row_slices_mut(n, t);
        for (row, pairs) in rows[k..].iter_mut().zip(&parity) {
            write_pairs(row, pairs);
        }
        matrix.mark_valid(k..n);
        RAW_SUCCESS
    }

    fn decode(
        &self,
        matrix: &mut CodewordMatrix,
        code: &CodeDescriptor,
        padding: Range<u16>,
    ) -> i8 {
        let k = code.k as usize;
        let n = code.n as usize;
        let t = code.t as usize;
        let pad_from = padding.start.min(code.k) as usize;
        let pad_to = padding.end.min(code.k) as usize;
        matrix.mark_padding(pad_from..pad_to, t);

        let validity = matrix.validity(n);
        if validity[..k].iter().all(|&v| v) {
            return RAW_SUCCESS;
        }
        let rs = match self.instance(code.k, code.parity()) {
            Ok(rs) => rs,
            Err(e) => {
                warn!("rs16: cannot build K={} N={} coder: {e}", code.k, code.n);
                return RAW_FAILED;
            }
        };
        let mut shards: Vec<Option<Vec<[u8; 2]>>> = (0..n)
            .map(|i| {
                if validity[i] {
                    Some(pairs_of(&matrix.row(i)[..t]))
                } else {
                    None
                }
            })
            .collect();
        match rs.reconstruct_data(&mut shards) {
            Ok(()) => {
                for (i, was_valid) in validity.iter().enumerate().take(k) {
                    if !*was_valid {
                        if let Some(pairs) = &shards[i] {
                            let bytes: Vec<u8> =
                                pairs.iter().flatten().copied().collect();
                            matrix.write_symbol(i, &bytes, t);
                        }
                    }
                }
                RAW_SUCCESS
            }
            Err(e) => {
                debug!("reconstruct K={} N={} failed: {e}", code.k, code.n);
                RAW_FAILED
            }
        }
    }

    fn status_to_generic(&self, status: i8) -> CodecOutcome {
        generic_of_raw(status)
    }

    fn status_to_string(&self, status: i8) -> &'static str {
        match generic_of_raw(status) {
            CodecOutcome::NotDecoded => "rs16: not decoded",
            CodecOutcome::Success => "rs16: success",
            CodecOutcome::Failed => "rs16: reconstruction failed",
        }
    }

    fn supports_continuous_mode(&self) -> bool {
        true
    }

    fn min_coding_window(&self) -> u16 {
        2
    }
}

/// Erasure reconstruction over byte shards: collect the valid rows,
/// reconstruct the data part, write recovered rows back.
fn reconstruct_data_rows<F>(
    matrix: &mut CodewordMatrix,
    code: &CodeDescriptor,
    padding: Range<u16>,
    reconstruct: F,
) -> i8
where
    F: FnOnce(
        &mut Vec<Option<Vec<u8>>>,
    ) -> std::result::Result<(), reed_solomon_erasure::Error>,
{
    let k = code.k as usize;
    let n = code.n as usize;
    let t = code.t as usize;
    let pad_from = padding.start.min(code.k) as usize;
    let pad_to = padding.end.min(code.k) as usize;
    matrix.mark_padding(pad_from..pad_to, t);

    let validity = matrix.validity(n);
    if validity[..k].iter().all(|&v| v) {
        return RAW_SUCCESS;
    }

    let mut shards: Vec<Option<Vec<u8>>> = (0..n)
        .map(|i| {
            if validity[i] {
                Some(matrix.row(i)[..t].to_vec())
            } else {
                None
            }
        })
        .collect();
    match reconstruct(&mut shards) {
        Ok(()) => {
            for (i, was_valid) in validity.iter().enumerate().take(k) {
                if !*was_valid {
                    if let Some(bytes) = &shards[i] {
                        matrix.write_symbol(i, bytes, t);
                    }
                }
            }
            RAW_SUCCESS
        }
        Err(e) => {
            debug!("reconstruct K={} N={} failed: {e}", code.k, code.n);
            RAW_FAILED
        }
    }
}

// ---------------------------------------------------------------------------
// Always-succeeds double
// ---------------------------------------------------------------------------

/// Backend that produces all-zero redundancy and reports success without
/// reconstructing anything. It exercises every pipeline path with the codec
/// math taken out of the picture.
pub struct NullCodec;

impl NullCodec {
    pub fn new() -> Self {
        NullCodec
    }
}

impl Default for NullCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecBackend for NullCodec {
    fn name(&self) -> &'static str {
        "null"
    }

    fn supported_codes(&self, symbol_len: u16) -> Vec<CodeDescriptor> {
        let mut codes = Vec::new();
        for k in [4u16, 8, 16, 32] {
            for parity in [k / 2, k] {
                codes.push(CodeDescriptor {
                    k,
                    n: k + parity,
                    t: symbol_len,
                    continuous: false,
                });
            }
        }
        codes
    }

    fn supports_code(&self, code: &CodeDescriptor) -> bool {
        code.k >= 1 && code.k < code.n && code.t >= 3
    }

    fn encode(&self, matrix: &mut CodewordMatrix, code: &CodeDescriptor) -> i8 {
        let k = code.k as usize;
        let n = code.n as usize;
        matrix.fill_zero(k..n, code.t as usize);
        matrix.mark_valid(k..n);
        RAW_SUCCESS
    }

    fn decode(
        &self,
        matrix: &mut CodewordMatrix,
        code: &CodeDescriptor,
        padding: Range<u16>,
    ) -> i8 {
        let pad_from = padding.start.min(code.k) as usize;
        let pad_to = padding.end.min(code.k) as usize;
        matrix.mark_padding(pad_from..pad_to, code.t as usize);
        RAW_SUCCESS
    }

    fn status_to_generic(&self, status: i8) -> CodecOutcome {
        generic_of_raw(status)
    }

    fn status_to_string(&self, status: i8) -> &'static str {
        match generic_of_raw(status) {
            CodecOutcome::NotDecoded => "null: not decoded",
            CodecOutcome::Success => "null: success",
            CodecOutcome::Failed => "null: failed",
        }
    }

    fn supports_continuous_mode(&self) -> bool {
        true
    }

    fn min_coding_window(&self) -> u16 {
        1
    }
}
