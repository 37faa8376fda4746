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

//! # Sender Pipeline
//!
//! Aggregates upper-protocol segments into coding matrices, encodes them,
//! and transmits every symbol as one datagram. Four stages plus a watchdog:
//!
//! - fill: one segment at a time into the current matrix; closes it when
//!   the aggregation bound is reached.
//! - codec: picks a code for the collected segment count and the estimated
//!   channel success rate, then encodes.
//! - send: frames symbols in sequence order, paces them out, flushes the
//!   matrix and wakes a fill worker blocked on a full pool.
//! - feedback: folds receiver loss reports into the success-rate estimate.
//! - watchdog: expires the aggregation window, forcing a partial matrix to
//!   the codec stage, or straight to send (uncoded) below the coding
//!   threshold.
//!
//! The matrix-id counter advances when a matrix closes, never when it is
//! assigned, so the feedback validity window's upper bound is simply the
//! counter value.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use rand::Rng;

use crate::catalog::FecCatalog;
use crate::codec::{CodecBackend, CodecOutcome};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::feedback::SuccessRateEstimator;
use crate::packet::{
    self, FeedbackReport, PacketHeader, FLAG_ALT_MODE, FLAG_CONTINUOUS_MODE, FLAG_FEEDBACK_REQUEST,
    LENGTH_PREFIX_LEN, WIRE_VERSION,
};
use crate::pool::{MatrixHandle, MatrixPool};
use crate::telemetry;
use crate::transport::{LowerTransport, UpperProtocol};

use super::{
    spawn_worker, stage_signal, StageNotifier, StageWaiter, WaitOutcome, POLL_INTERVAL,
    WATCHDOG_TICK,
};

/// Upper bound (exclusive) of the randomized initial matrix id. A restarted
/// sender thereby rarely resumes numbering where stale receiver state
/// expects it.
const INITIAL_MID_RANGE: u16 = 2048;

struct SenderCtx {
    config: Config,
    backend: Arc<dyn CodecBackend>,
    catalog: FecCatalog,
    pool: MatrixPool,
    estimator: Mutex<SuccessRateEstimator>,
    /// Id of the matrix currently aggregating; incremented when it closes.
    next_mid: AtomicU16,
    exit: AtomicBool,
}

pub struct SenderPipeline {
    ctx: Arc<SenderCtx>,
    workers: Vec<JoinHandle<()>>,
}

impl SenderPipeline {
    pub fn start(
        mut config: Config,
        backend: Arc<dyn CodecBackend>,
        upper: Arc<dyn UpperProtocol>,
        lower: Arc<dyn LowerTransport>,
    ) -> Result<Self> {
        config.validate(backend.as_ref())?;
        let catalog = FecCatalog::new(
            backend.as_ref(),
            config.symbol_len,
            config.adaptive || config.continuous,
            config.continuous,
            config.k,
            config.n,
        )?;
        let pool = MatrixPool::new(
            config.static_slots,
            config.max_dynamic,
            catalog.max_n() as usize,
            config.symbol_len as usize,
        )?;
        let initial_mid = if config.static_mid {
            0
        } else {
            rand::thread_rng().gen_range(0..INITIAL_MID_RANGE)
        };
        let initial_rate = config.k as f32 / config.n as f32;
        let estimator = SuccessRateEstimator::new(initial_rate, initial_mid);
        telemetry::SUCCESS_RATE.set(estimator.rate() as f64);
        info!(
            "sender up: engine {}, codec {}, T={}, window {}ms, first matrix {}",
            config.engine_id,
            backend.name(),
            config.symbol_len,
            config.aggregation_window_ms,
            initial_mid
        );

        let ctx = Arc::new(SenderCtx {
            config,
            backend,
            catalog,
            pool,
            estimator: Mutex::new(estimator),
            next_mid: AtomicU16::new(initial_mid),
            exit: AtomicBool::new(false),
        });

        let (codec_notifier, codec_waiter) = stage_signal();
        let (send_notifier, send_waiter) = stage_signal();
        let (slot_notifier, slot_waiter) = stage_signal();

        let mut workers = Vec::new();
        {
            let ctx = ctx.clone();
            let codec = codec_notifier.clone();
            workers.push(spawn_worker("tx-fill", move || {
                fill_worker(ctx, upper, codec, slot_waiter)
            }));
        }
        {
            let ctx = ctx.clone();
            let send = send_notifier.clone();
            workers.push(spawn_worker("tx-codec", move || {
                codec_worker(ctx, codec_waiter, send)
            }));
        }
        {
            let ctx = ctx.clone();
            let lower = lower.clone();
            workers.push(spawn_worker("tx-send", move || {
                send_worker(ctx, send_waiter, lower, slot_notifier)
            }));
        }
        if ctx.config.feedback_request {
            let ctx = ctx.clone();
            workers.push(spawn_worker("tx-feedback", move || {
                feedback_worker(ctx, lower)
            }));
        }
        {
            let ctx = ctx.clone();
            workers.push(spawn_worker("tx-watchdog", move || {
                watchdog_worker(ctx, codec_notifier, send_notifier)
            }));
        }
        Ok(SenderPipeline { ctx, workers })
    }

    /// Current EWMA channel success-rate estimate.
    pub fn success_rate(&self) -> f32 {
        self.ctx.estimator.lock().unwrap().rate()
    }

    /// Matrices currently held by the pool (filling, coding or sending).
    pub fn in_flight(&self) -> usize {
        self.ctx.pool.occupied()
    }

    /// Signals every worker to finish and joins them.
    pub fn stop(self) {
        self.ctx.exit.store(true, Ordering::Relaxed);
        for worker in self.workers {
            let _ = worker.join();
        }
        info!("sender pipeline stopped");
    }
}

fn fill_worker(
    ctx: Arc<SenderCtx>,
    upper: Arc<dyn UpperProtocol>,
    codec: StageNotifier,
    slots: StageWaiter,
) {
    let max_segment = ctx.config.symbol_len as usize - LENGTH_PREFIX_LEN;
    while !ctx.exit.load(Ordering::Relaxed) {
        let segment = match upper.receive_segment() {
            Ok(Some(segment)) => segment,
            Ok(None) => continue,
            Err(Error::TransportClosed) => {
                info!("upper protocol closed; fill worker exiting");
                break;
            }
            Err(e) => {
                warn!("upper protocol receive failed: {e}");
                continue;
            }
        };
        if segment.len() > max_segment {
            warn!(
                "dropping {}-byte segment; symbol length {} fits at most {}",
                segment.len(),
                ctx.config.symbol_len,
                max_segment
            );
            continue;
        }
        if !append_segment(&ctx, &segment, &codec, &slots) {
            break;
        }
    }
    trace!("fill worker stopped");
}

/// Buffers one segment into the current aggregation matrix, opening a new
/// one as needed. Returns false only when exit was requested while blocked.
fn append_segment(
    ctx: &SenderCtx,
    segment: &[u8],
    codec: &StageNotifier,
    slots: &StageWaiter,
) -> bool {
    let rows = ctx.catalog.max_n() as usize;
    let cols = ctx.config.symbol_len as usize;
    loop {
        if ctx.exit.load(Ordering::Relaxed) {
            return false;
        }
        let mid = ctx.next_mid.load(Ordering::Relaxed);
        let (handle, fresh) = match ctx.pool.get_or_allocate(ctx.config.engine_id, mid, rows, cols)
        {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                trace!("pool full; fill waiting for a slot");
                slots.wait(POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                error!("matrix allocation failed: {e}");
                slots.wait(POLL_INTERVAL);
                continue;
            }
        };
        if buffer_segment(ctx, &handle, fresh, segment, codec) {
            return true;
        }
    }
}

/// Inserts one segment into a looked-up matrix under its lock. Returns false
/// when the slot turned out closed or already recycled between the pool
/// lookup and the lock; the caller retries against the advanced counter.
fn buffer_segment(
    ctx: &SenderCtx,
    handle: &MatrixHandle,
    fresh: bool,
    segment: &[u8],
    codec: &StageNotifier,
) -> bool {
    let mut m = handle.lock().unwrap();
    if fresh {
        m.max_info_size = ctx.catalog.biggest().k;
        m.working_t = ctx.config.symbol_len;
        m.feedback_requested = ctx.config.feedback_request;
        m.continuous = ctx.config.continuous;
        m.alt_mode = ctx.config.alt_mode;
        m.timer.start(ctx.config.window());
        debug!(
            "opened matrix {}, aggregating up to {} segments",
            m.matrix_id, m.max_info_size
        );
    } else if m.is_empty() || m.cleared_to_codec || m.cleared_to_send {
        // The watchdog closed this matrix after we read its id, and the
        // send worker may already have flushed the slot; the counter has
        // moved on in either case.
        return false;
    }
    if !m.insert_info_segment(segment) {
        warn!("matrix {} rejected segment {}", m.matrix_id, m.info_count);
        return true;
    }
    trace!(
        "segment {} of matrix {} buffered ({} bytes)",
        m.info_count - 1,
        m.matrix_id,
        segment.len()
    );
    if m.is_info_full() {
        m.timer.stop();
        m.cleared_to_codec = true;
        ctx.next_mid.fetch_add(1, Ordering::Relaxed);
        debug!("matrix {} full with {} segments", m.matrix_id, m.info_count);
        drop(m);
        codec.raise();
    }
    true
}

fn codec_worker(ctx: Arc<SenderCtx>, waiter: StageWaiter, send: StageNotifier) {
    while !ctx.exit.load(Ordering::Relaxed) {
        if waiter.wait(POLL_INTERVAL) == WaitOutcome::Closed {
            break;
        }
        while let Some(handle) = ctx
            .pool
            .next_ready(|m| m.cleared_to_codec && !m.cleared_to_send)
        {
            encode_matrix(&ctx, &handle);
            send.raise();
        }
    }
    trace!("codec worker stopped");
}

fn encode_matrix(ctx: &SenderCtx, handle: &MatrixHandle) {
    let mut m = handle.lock().unwrap();
    if !m.cleared_to_codec || m.cleared_to_send {
        return;
    }
    let rate = ctx.estimator.lock().unwrap().rate();
    let code = ctx.catalog.best_code(m.info_count, rate);
    let info = m.info_count as usize;
    let t = m.working_t as usize;
    // Information slots the aggregation never filled enter the code as
    // zero rows; the receiver pads the same range before decode.
    m.codeword.fill_zero(info..code.k as usize, t);
    let status = ctx.backend.encode(&mut m.codeword, &code);
    m.code = Some(code);
    m.codec_status = status;
    m.outcome = ctx.backend.status_to_generic(status);
    if m.outcome == CodecOutcome::Success {
        m.redundancy_count = code.parity();
    }
    m.cleared_to_send = true;
    telemetry::MATRICES_ENCODED.inc();
    if m.outcome == CodecOutcome::Success {
        debug!(
            "matrix {} encoded as ({}, {}) at estimated rate {:.2}",
            m.matrix_id, code.k, code.n, rate
        );
    } else {
        warn!(
            "encode of matrix {} reported '{}'; sending information symbols only",
            m.matrix_id,
            ctx.backend.status_to_string(status)
        );
    }
}

fn send_worker(
    ctx: Arc<SenderCtx>,
    waiter: StageWaiter,
    lower: Arc<dyn LowerTransport>,
    slots: StageNotifier,
) {
    let pacer = Pacer::new(ctx.config.tx_rate_bps);
    'outer: while !ctx.exit.load(Ordering::Relaxed) {
        if waiter.wait(POLL_INTERVAL) == WaitOutcome::Closed {
            break;
        }
        while let Some(handle) = ctx.pool.next_ready(|m| m.cleared_to_send) {
            let packets = frame_matrix(&ctx, &handle);
            for packet in &packets {
                match lower.send_packet(packet, None) {
                    Ok(()) => telemetry::PACKETS_SENT.inc(),
                    Err(Error::TransportClosed) => {
                        info!("lower transport closed; send worker exiting");
                        break 'outer;
                    }
                    Err(e) => warn!("packet send failed: {e}"),
                }
                pacer.pace(packet.len());
            }
            if ctx.pool.flush(&handle) {
                slots.raise();
            }
        }
    }
    trace!("send worker stopped");
}

/// Frames every outgoing packet for one matrix while its lock is held; the
/// caller transmits after the guard is gone.
fn frame_matrix(ctx: &SenderCtx, handle: &MatrixHandle) -> Vec<Vec<u8>> {
    let mut m = handle.lock().unwrap();
    if !m.cleared_to_send {
        return Vec::new();
    }
    let mut flags = 0u8;
    if m.feedback_requested {
        flags |= FLAG_FEEDBACK_REQUEST;
    }
    if m.continuous {
        flags |= FLAG_CONTINUOUS_MODE;
    }
    if m.alt_mode {
        flags |= FLAG_ALT_MODE;
    }
    let mut packets = Vec::new();
    match m.code {
        Some(code) => {
            let info_count = m.info_count;
            // Rows [K, N) hold real redundancy only after a successful
            // encode; on failure the information symbols leave alone.
            let add_redundancy = m.outcome == CodecOutcome::Success;
            m.sequence
                .reload(&code, add_redundancy, ctx.config.interleave, info_count);
            for &symbol_id in m.sequence.as_slice() {
                let header = PacketHeader {
                    version: WIRE_VERSION,
                    ext_count: 0,
                    flags,
                    engine_id: m.engine_id,
                    matrix_id: m.matrix_id,
                    symbol_id,
                    info_segments_added: info_count,
                    k: code.k,
                    n: code.n,
                    t: code.t,
                };
                let row = m.codeword.row(symbol_id as usize);
                let framed = if symbol_id < code.k {
                    packet::frame_info_symbol(&header, row)
                } else {
                    packet::frame_redundancy_symbol(&header, row)
                };
                match framed {
                    Ok(p) => packets.push(p),
                    Err(e) => warn!("skipping symbol {symbol_id} of matrix {}: {e}", m.matrix_id),
                }
            }
            debug!(
                "matrix {} out: {} packets as ({}, {})",
                m.matrix_id,
                packets.len(),
                code.k,
                code.n
            );
        }
        None => {
            // Closed below the coding threshold: each collected segment
            // leaves as an uncoded passthrough packet.
            for index in 0..m.info_count {
                let row = m.codeword.row(index as usize);
                let declared = u16::from_be_bytes([row[0], row[1]]) as usize;
                let header = PacketHeader {
                    version: WIRE_VERSION,
                    ext_count: 0,
                    flags,
                    engine_id: m.engine_id,
                    matrix_id: m.matrix_id,
                    symbol_id: index,
                    info_segments_added: m.info_count,
                    k: 0,
                    n: 0,
                    t: m.working_t,
                };
                let segment = &row[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + declared];
                match packet::frame_uncoded(&header, segment) {
                    Ok(p) => packets.push(p),
                    Err(e) => warn!("skipping uncoded segment {index}: {e}"),
                }
            }
            debug!(
                "matrix {} out: {} uncoded segments",
                m.matrix_id, m.info_count
            );
        }
    }
    packets
}

fn feedback_worker(ctx: Arc<SenderCtx>, lower: Arc<dyn LowerTransport>) {
    let mut buf = [0u8; 64];
    while !ctx.exit.load(Ordering::Relaxed) {
        let len = match lower.receive_packet(&mut buf) {
            Ok(Some((len, _))) => len,
            Ok(None) => continue,
            Err(Error::TransportClosed) => {
                info!("feedback transport closed; feedback worker exiting");
                break;
            }
            Err(e) => {
                warn!("feedback receive failed: {e}");
                continue;
            }
        };
        let report = match FeedbackReport::parse(&buf[..len]) {
            Ok(report) => report,
            Err(e) => {
                telemetry::PACKETS_MALFORMED.inc();
                warn!("dropping feedback datagram: {e}");
                continue;
            }
        };
        let outcome = ctx.backend.status_to_generic(report.codec_status);
        if !ctx.config.feedback_adaptive {
            debug!(
                "feedback for matrix {}: {}/{} symbols, decode {}",
                report.matrix_id, report.received_segments, report.total_segments, outcome
            );
            continue;
        }
        let window_hi = ctx.next_mid.load(Ordering::Relaxed);
        let mut estimator = ctx.estimator.lock().unwrap();
        if estimator.is_valid(&report, window_hi) {
            let rate = estimator.apply(&report, outcome);
            telemetry::FEEDBACK_ACCEPTED.inc();
            telemetry::SUCCESS_RATE.set(rate as f64);
            info!(
                "success rate {:.3} after feedback for matrix {} ({}/{}, decode {})",
                rate, report.matrix_id, report.received_segments, report.total_segments, outcome
            );
        } else {
            telemetry::FEEDBACK_REJECTED.inc();
            debug!(
                "ignoring stale or inconsistent feedback for matrix {}",
                report.matrix_id
            );
        }
    }
    trace!("feedback worker stopped");
}

fn watchdog_worker(ctx: Arc<SenderCtx>, codec: StageNotifier, send: StageNotifier) {
    while !ctx.exit.load(Ordering::Relaxed) {
        thread::sleep(WATCHDOG_TICK);
        let now = Instant::now();
        for (handle, generation) in ctx.pool.armed_timers() {
            let mut m = handle.lock().unwrap();
            if m.timer.generation() != generation || !m.timer.expired(now) {
                continue;
            }
            m.timer.stop();
            if m.cleared_to_codec || m.cleared_to_send {
                continue;
            }
            // The timer starts with the first segment, so at least one was
            // collected.
            if m.info_count >= ctx.config.coding_threshold {
                m.cleared_to_codec = true;
                ctx.next_mid.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "window expired; coding matrix {} with {} segments",
                    m.matrix_id, m.info_count
                );
                drop(m);
                codec.raise();
            } else {
                m.cleared_to_send = true;
                ctx.next_mid.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "window expired; matrix {} below threshold ({} < {}), sending uncoded",
                    m.matrix_id, m.info_count, ctx.config.coding_threshold
                );
                drop(m);
                send.raise();
            }
        }
    }
    trace!("sender watchdog stopped");
}

/// Sleep-after-send pacing against a configured bit rate; zero disables it.
struct Pacer {
    rate_bps: u64,
}

impl Pacer {
    fn new(rate_bps: u64) -> Self {
        Pacer { rate_bps }
    }

    fn pace(&self, bytes: usize) {
        if self.rate_bps == 0 {
            return;
        }
        let seconds = (bytes as f64 * 8.0) / self.rate_bps as f64;
        thread::sleep(Duration::from_secs_f64(seconds));
    }
}
