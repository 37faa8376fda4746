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

//! # FEC Code Catalog
//!
//! Holds the set of (K, N, T) code configurations a daemon may use, sorted
//! for deterministic selection, and picks the best code for a given
//! information-symbol count and estimated channel success rate. In
//! continuous mode the catalog synthesizes a code with an arbitrary N
//! instead of selecting from the fixed set.

use crate::codec::CodecBackend;
use crate::error::{Error, Result};

/// One erasure-code configuration: K information symbols, N total symbols,
/// T bytes per symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeDescriptor {
    pub k: u16,
    pub n: u16,
    pub t: u16,
    pub continuous: bool,
}

impl CodeDescriptor {
    pub fn parity(&self) -> u16 {
        self.n - self.k
    }

    /// Code rate when `info_count` of the K slots are actually used.
    fn effective_rate(&self, info_count: u16) -> f32 {
        info_count as f32 / (info_count as f32 + self.parity() as f32)
    }
}

/// Extra symbols added on top of the loss-rate estimate when synthesizing a
/// continuous-mode N. Must stay above every backend's minimum coding window.
pub const CONTINUOUS_MARGIN: u16 = 8;

pub const MIN_SUCCESS_RATE: f32 = 0.01;
pub const MAX_SUCCESS_RATE: f32 = 0.99;

pub struct FecCatalog {
    codes: Vec<CodeDescriptor>,
    symbol_len: u16,
    max_n: u16,
    fallback: CodeDescriptor,
    continuous: bool,
}

impl FecCatalog {
    /// Builds the catalog for one daemon. With `adaptive` set, the code set
    /// is whatever the backend reports for this symbol length; otherwise the
    /// single `(default_k, default_n)` code is used. `continuous` only
    /// changes how N is chosen at encode time; the code set still bounds it.
    pub fn new(
        backend: &dyn CodecBackend,
        symbol_len: u16,
        adaptive: bool,
        continuous: bool,
        default_k: u16,
        default_n: u16,
    ) -> Result<Self> {
        let mut codes = if adaptive {
            backend.supported_codes(symbol_len)
        } else {
            vec![CodeDescriptor {
                k: default_k,
                n: default_n,
                t: symbol_len,
                continuous: false,
            }]
        };
        if codes.is_empty() {
            return Err(Error::Config(format!(
                "backend {} offers no codes for symbol length {}",
                backend.name(),
                symbol_len
            )));
        }
        for code in &codes {
            if code.k >= code.n {
                return Err(Error::Config(format!(
                    "invalid code K={} N={}: K must be < N",
                    code.k, code.n
                )));
            }
            if !backend.supports_code(code) {
                return Err(Error::Config(format!(
                    "backend {} does not support code K={} N={} T={}",
                    backend.name(),
                    code.k,
                    code.n,
                    code.t
                )));
            }
        }
        if continuous && CONTINUOUS_MARGIN <= backend.min_coding_window() {
            return Err(Error::Config(format!(
                "continuous margin {} does not clear backend {} minimum window {}",
                CONTINUOUS_MARGIN,
                backend.name(),
                backend.min_coding_window()
            )));
        }
        codes.sort_by_key(|c| (c.k, c.n));
        codes.dedup_by_key(|c| (c.k, c.n));
        let max_n = codes.iter().map(|c| c.n).max().unwrap_or(default_n);
        let fallback = *codes
            .iter()
            .max_by_key(|c| c.n)
            .expect("catalog is non-empty");
        Ok(FecCatalog {
            codes,
            symbol_len,
            max_n,
            fallback,
            continuous,
        })
    }

    pub fn symbol_len(&self) -> u16 {
        self.symbol_len
    }

    pub fn max_n(&self) -> u16 {
        self.max_n
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// The largest code in (K, N) order; its K is the aggregation bound for
    /// sender-side fill.
    pub fn biggest(&self) -> CodeDescriptor {
        *self.codes.last().expect("catalog is non-empty")
    }

    /// Selects the code for `info_count` collected symbols under the current
    /// success-rate estimate. First code whose K fits and whose redundancy
    /// overhead is affordable wins; with nothing affordable, the largest-N
    /// code is returned rather than refusing to encode.
    pub fn best_code(&self, info_count: u16, success_rate: f32) -> CodeDescriptor {
        if self.continuous {
            return self.continuous_code(info_count, success_rate);
        }
        for code in &self.codes {
            if info_count <= code.k && code.effective_rate(info_count) <= success_rate {
                return *code;
            }
        }
        self.fallback
    }

    /// Continuous-mode synthesis: enough total symbols that the expected
    /// number surviving the channel covers `info_count`, plus a fixed margin,
    /// clamped to the largest N any catalog code uses.
    fn continuous_code(&self, info_count: u16, success_rate: f32) -> CodeDescriptor {
        let rate = success_rate.clamp(MIN_SUCCESS_RATE, MAX_SUCCESS_RATE);
        let wanted = (info_count as f32 / rate).ceil() as u32 + CONTINUOUS_MARGIN as u32;
        let n = wanted.min(self.max_n as u32).max(info_count as u32 + 1) as u16;
        CodeDescriptor {
            k: info_count,
            n,
            t: self.symbol_len,
            continuous: true,
        }
    }

    /// Looks up the code a received header declares. Exact (K, N) match in
    /// catalog mode; range validation in continuous mode, where every sender
    /// chooses its own N. `t` is the header's symbol length and must not
    /// exceed what this catalog was sized for.
    pub fn get_code(&self, k: u16, n: u16, t: u16, continuous: bool) -> Option<CodeDescriptor> {
        if t == 0 || t > self.symbol_len {
            return None;
        }
        if continuous {
            if k >= 1 && k < n && n <= self.max_n {
                return Some(CodeDescriptor {
                    k,
                    n,
                    t,
                    continuous: true,
                });
            }
            return None;
        }
        self.codes
            .iter()
            .find(|c| c.k == k && c.n == n)
            .map(|c| CodeDescriptor { t, ..*c })
    }
}
