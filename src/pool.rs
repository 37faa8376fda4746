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

//! # Matrix Pool
//!
//! Bounded home of all in-flight coding matrices: a fixed set of static
//! slots whose arenas are allocated once and recycled in place, plus a
//! capacity-limited dynamic region for bursts, freed again on flush. At most
//! one matrix exists per live (engine id, matrix id) identity; lookup by
//! identity always wins over allocating a new slot.
//!
//! Lock ordering: pool methods take the pool lock first and individual
//! matrix locks second, and only for short field inspections. Workers hold a
//! matrix lock on its own and must never call back into the pool while they
//! do; they drop the guard, then flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::error::Result;
use crate::matrix::CodingMatrix;

/// Shared handle to one pool slot's matrix.
pub type MatrixHandle = Arc<Mutex<CodingMatrix>>;

struct Slot {
    matrix: MatrixHandle,
    dynamic: bool,
}

struct PoolInner {
    slots: Vec<Slot>,
    /// (engine id, matrix id, slot index) of the most recently returned
    /// slot. Maintained by every method that assigns, moves, or frees a
    /// slot, so a hit needs no verification.
    last: Option<(u16, u16, usize)>,
}

pub struct MatrixPool {
    inner: Mutex<PoolInner>,
    rows: usize,
    cols: usize,
    max_dynamic: usize,
    next_global: AtomicU64,
}

impl MatrixPool {
    /// Builds the static region up front; an arena allocation failure here
    /// is fatal to startup and leaves nothing behind.
    pub fn new(static_slots: usize, max_dynamic: usize, rows: usize, cols: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(static_slots);
        for _ in 0..static_slots {
            slots.push(Slot {
                matrix: Arc::new(Mutex::new(CodingMatrix::new(rows, cols)?)),
                dynamic: false,
            });
        }
        Ok(MatrixPool {
            inner: Mutex::new(PoolInner { slots, last: None }),
            rows,
            cols,
            max_dynamic,
            next_global: AtomicU64::new(1),
        })
    }

    /// Finds the matrix for an identity or assigns a slot to it. Returns
    /// `None` when every slot is occupied (backpressure, not an error); the
    /// boolean is true when the identity was assigned just now and the
    /// caller must configure the matrix.
    pub fn get_or_allocate(
        &self,
        engine_id: u16,
        matrix_id: u16,
        min_rows: usize,
        min_cols: usize,
    ) -> Result<Option<(MatrixHandle, bool)>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some((engine, matrix, index)) = inner.last {
            if engine == engine_id && matrix == matrix_id {
                return Ok(Some((inner.slots[index].matrix.clone(), false)));
            }
        }

        let mut empty = None;
        let mut found = None;
        for (index, slot) in inner.slots.iter().enumerate() {
            let m = slot.matrix.lock().unwrap();
            if m.is_empty() {
                if empty.is_none()
                    && m.codeword.rows() >= min_rows
                    && m.codeword.cols() >= min_cols
                {
                    empty = Some(index);
                }
                continue;
            }
            if m.engine_id == engine_id && m.matrix_id == matrix_id {
                found = Some((index, slot.matrix.clone()));
                break;
            }
        }
        if let Some((index, handle)) = found {
            inner.last = Some((engine_id, matrix_id, index));
            return Ok(Some((handle, false)));
        }

        let index = match empty {
            Some(index) => index,
            None => {
                let dynamic = inner.slots.iter().filter(|s| s.dynamic).count();
                if dynamic >= self.max_dynamic {
                    trace!(
                        "pool busy for ({}, {}): {} slots occupied",
                        engine_id,
                        matrix_id,
                        inner.slots.len()
                    );
                    return Ok(None);
                }
                let rows = min_rows.max(self.rows);
                let cols = min_cols.max(self.cols);
                inner.slots.push(Slot {
                    matrix: Arc::new(Mutex::new(CodingMatrix::new(rows, cols)?)),
                    dynamic: true,
                });
                debug!(
                    "grew dynamic region to {} slot(s) ({}x{}) for ({}, {})",
                    dynamic + 1,
                    rows,
                    cols,
                    engine_id,
                    matrix_id
                );
                inner.slots.len() - 1
            }
        };

        let slot = &inner.slots[index];
        let global_id = self.next_global.fetch_add(1, Ordering::Relaxed);
        slot.matrix
            .lock()
            .unwrap()
            .assign(engine_id, matrix_id, global_id);
        let handle = slot.matrix.clone();
        inner.last = Some((engine_id, matrix_id, index));
        Ok(Some((handle, true)))
    }

    /// Returns the matrix to Empty. Dynamic slots are dropped entirely,
    /// static ones recycled in place. Flushing an Empty or already-removed
    /// matrix is a no-op returning false, so a double flush never yields a
    /// duplicate slot-freed signal.
    pub fn flush(&self, handle: &MatrixHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let index = match inner
            .slots
            .iter()
            .position(|slot| Arc::ptr_eq(&slot.matrix, handle))
        {
            Some(index) => index,
            None => return false,
        };
        {
            let mut m = inner.slots[index].matrix.lock().unwrap();
            if m.is_empty() {
                return false;
            }
            trace!("flushed matrix ({}, {})", m.engine_id, m.matrix_id);
            m.reset();
        }
        if inner.slots[index].dynamic {
            inner.slots.remove(index);
            inner.last = match inner.last {
                Some((_, _, cached)) if cached == index => None,
                Some((e, m, cached)) if cached > index => Some((e, m, cached - 1)),
                other => other,
            };
        } else if matches!(inner.last, Some((_, _, cached)) if cached == index) {
            inner.last = None;
        }
        true
    }

    /// The occupied matrix with the lowest global id satisfying `pred`, if
    /// any. Stage workers use this to consume matrices in arrival order.
    pub fn next_ready<F>(&self, pred: F) -> Option<MatrixHandle>
    where
        F: Fn(&CodingMatrix) -> bool,
    {
        let inner = self.inner.lock().unwrap();
        let mut best: Option<(u64, MatrixHandle)> = None;
        for slot in &inner.slots {
            let m = slot.matrix.lock().unwrap();
            if m.is_empty() || !pred(&m) {
                continue;
            }
            if best.as_ref().map_or(true, |(gid, _)| m.global_id < *gid) {
                best = Some((m.global_id, slot.matrix.clone()));
            }
        }
        best.map(|(_, handle)| handle)
    }

    /// All occupied matrices satisfying `pred`, in global id order.
    pub fn collect<F>(&self, pred: F) -> Vec<MatrixHandle>
    where
        F: Fn(&CodingMatrix) -> bool,
    {
        let inner = self.inner.lock().unwrap();
        let mut found: Vec<(u64, MatrixHandle)> = Vec::new();
        for slot in &inner.slots {
            let m = slot.matrix.lock().unwrap();
            if !m.is_empty() && pred(&m) {
                found.push((m.global_id, slot.matrix.clone()));
            }
        }
        found.sort_by_key(|(gid, _)| *gid);
        found.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Snapshot of every armed watchdog: the handle plus the generation the
    /// timer had when observed. A fire is acted on only after re-validating
    /// the generation under the matrix lock.
    pub fn armed_timers(&self) -> Vec<(MatrixHandle, u64)> {
        let inner = self.inner.lock().unwrap();
        let mut armed = Vec::new();
        for slot in &inner.slots {
            let m = slot.matrix.lock().unwrap();
            if !m.is_empty() && m.timer.is_armed() {
                armed.push((slot.matrix.clone(), m.timer.generation()));
            }
        }
        armed
    }

    /// Occupied slot count, for periodic state logging.
    pub fn occupied(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter(|slot| !slot.matrix.lock().unwrap().is_empty())
            .count()
    }
}
