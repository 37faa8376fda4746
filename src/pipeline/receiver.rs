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

//! # Receiver Pipeline
//!
//! Rebuilds matrices from incoming datagrams and hands recovered segments
//! upward. Three stages plus a watchdog:
//!
//! - fill: deframes packets, passes uncoded ones straight through, routes
//!   coded symbols into their matrix and closes it when complete enough.
//! - decode: reconstructs missing information symbols, unless every
//!   transmitted one already arrived (fast path, nothing to do).
//! - deliver: poisons the identity, hands valid non-empty segments up in
//!   symbol order, reports losses back, flushes the slot.
//!
//! Input is hostile by assumption: anything malformed, duplicated, stale,
//! or inconsistent is dropped (and at worst blacklisted), never fatal.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, error, info, trace, warn};

use crate::blacklist::Blacklist;
use crate::catalog::FecCatalog;
use crate::codec::{CodecBackend, CodecOutcome};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::{
    self, FeedbackReport, ParsedPacket, FLAG_ALT_MODE, FLAG_CONTINUOUS_MODE, FLAG_FEEDBACK_REQUEST,
    LENGTH_PREFIX_LEN, MAX_PACKET_LEN,
};
use crate::pool::{MatrixHandle, MatrixPool};
use crate::telemetry;
use crate::transport::{LowerTransport, UpperProtocol};

use super::{
    spawn_worker, stage_signal, StageNotifier, StageWaiter, WaitOutcome, POLL_INTERVAL,
    WATCHDOG_TICK,
};

struct ReceiverCtx {
    config: Config,
    backend: Arc<dyn CodecBackend>,
    catalog: FecCatalog,
    pool: MatrixPool,
    blacklist: Mutex<Blacklist>,
    exit: AtomicBool,
}

pub struct ReceiverPipeline {
    ctx: Arc<ReceiverCtx>,
    workers: Vec<JoinHandle<()>>,
}

impl ReceiverPipeline {
    pub fn start(
        mut config: Config,
        backend: Arc<dyn CodecBackend>,
        upper: Arc<dyn UpperProtocol>,
        lower: Arc<dyn LowerTransport>,
    ) -> Result<Self> {
        config.validate(backend.as_ref())?;
        // The receiver accepts whatever geometry a sender declares, so its
        // catalog always spans the backend's whole ladder.
        let catalog = FecCatalog::new(
            backend.as_ref(),
            config.symbol_len,
            true,
            false,
            config.k,
            config.n,
        )?;
        let pool = MatrixPool::new(
            config.static_slots,
            config.max_dynamic,
            catalog.max_n() as usize,
            config.symbol_len as usize,
        )?;
        info!(
            "receiver up: codec {}, T={}, window {}ms, {}+{} pool slots",
            backend.name(),
            config.symbol_len,
            config.aggregation_window_ms,
            config.static_slots,
            config.max_dynamic
        );

        let ctx = Arc::new(ReceiverCtx {
            config,
            backend,
            catalog,
            pool,
            blacklist: Mutex::new(Blacklist::new()),
            exit: AtomicBool::new(false),
        });

        let (decode_notifier, decode_waiter) = stage_signal();
        let (deliver_notifier, deliver_waiter) = stage_signal();
        let (slot_notifier, slot_waiter) = stage_signal();

        let mut workers = Vec::new();
        {
            let ctx = ctx.clone();
            let lower = lower.clone();
            let upper = upper.clone();
            let decode = decode_notifier.clone();
            workers.push(spawn_worker("rx-fill", move || {
                fill_worker(ctx, lower, upper, decode, slot_waiter)
            }));
        }
        {
            let ctx = ctx.clone();
            workers.push(spawn_worker("rx-decode", move || {
                decode_worker(ctx, decode_waiter, deliver_notifier)
            }));
        }
        {
            let ctx = ctx.clone();
            workers.push(spawn_worker("rx-deliver", move || {
                deliver_worker(ctx, deliver_waiter, upper, lower, slot_notifier)
            }));
        }
        {
            let ctx = ctx.clone();
            workers.push(spawn_worker("rx-watchdog", move || {
                watchdog_worker(ctx, decode_notifier)
            }));
        }
        Ok(ReceiverPipeline { ctx, workers })
    }

    /// Matrices currently being rebuilt.
    pub fn in_flight(&self) -> usize {
        self.ctx.pool.occupied()
    }

    /// Signals every worker to finish and joins them.
    pub fn stop(self) {
        self.ctx.exit.store(true, Ordering::Relaxed);
        for worker in self.workers {
            let _ = worker.join();
        }
        info!("receiver pipeline stopped");
    }
}

fn fill_worker(
    ctx: Arc<ReceiverCtx>,
    lower: Arc<dyn LowerTransport>,
    upper: Arc<dyn UpperProtocol>,
    decode: StageNotifier,
    slots: StageWaiter,
) {
    let mut buf = vec![0u8; MAX_PACKET_LEN];
    while !ctx.exit.load(Ordering::Relaxed) {
        let (len, source) = match lower.receive_packet(&mut buf) {
            Ok(Some(received)) => received,
            Ok(None) => continue,
            Err(Error::TransportClosed) => {
                info!("lower transport closed; fill worker exiting");
                break;
            }
            Err(e) => {
                warn!("packet receive failed: {e}");
                continue;
            }
        };
        telemetry::PACKETS_RECEIVED.inc();
        let parsed = match packet::parse_packet(&buf[..len]) {
            Ok(parsed) => parsed,
            Err(e) => {
                telemetry::PACKETS_MALFORMED.inc();
                warn!("dropping malformed packet: {e}");
                continue;
            }
        };
        let h = parsed.header;
        trace!(
            "packet in: engine {} matrix {} symbol {} ({}/{}, T={})",
            h.engine_id,
            h.matrix_id,
            h.symbol_id,
            h.k,
            h.n,
            h.t
        );
        if h.is_uncoded() {
            // Passthrough never touches the pool or the blacklist.
            match upper.send_segment(parsed.uncoded_segment(), CodecOutcome::NotDecoded) {
                Ok(()) => telemetry::SEGMENTS_DELIVERED.inc(),
                Err(Error::TransportClosed) => {
                    info!("upper protocol closed; fill worker exiting");
                    break;
                }
                Err(e) => warn!("passthrough delivery failed: {e}"),
            }
            continue;
        }
        if !process_symbol(&ctx, &parsed, source, &decode, &slots) {
            break;
        }
    }
    trace!("fill worker stopped");
}

/// Routes one coded symbol into its matrix. Returns false only when exit
/// was requested while blocked on a full pool.
fn process_symbol(
    ctx: &ReceiverCtx,
    parsed: &ParsedPacket<'_>,
    source: Option<SocketAddr>,
    decode: &StageNotifier,
    slots: &StageWaiter,
) -> bool {
    let h = parsed.header;
    if ctx.blacklist.lock().unwrap().contains(h.engine_id, h.matrix_id) {
        telemetry::BLACKLIST_DROPS.inc();
        trace!(
            "dropping symbol for blacklisted matrix ({}, {})",
            h.engine_id,
            h.matrix_id
        );
        return true;
    }
    let code = match ctx
        .catalog
        .get_code(h.k, h.n, h.t, h.has_flag(FLAG_CONTINUOUS_MODE))
    {
        Some(code) => code,
        None => {
            telemetry::PACKETS_MALFORMED.inc();
            warn!("no catalog code ({}, {}) for T={}", h.k, h.n, h.t);
            return true;
        }
    };
    let (handle, fresh) = loop {
        if ctx.exit.load(Ordering::Relaxed) {
            return false;
        }
        match ctx
            .pool
            .get_or_allocate(h.engine_id, h.matrix_id, h.n as usize, h.t as usize)
        {
            Ok(Some(slot)) => break slot,
            Ok(None) => {
                trace!("pool full; holding symbol for ({}, {})", h.engine_id, h.matrix_id);
                slots.wait(POLL_INTERVAL);
            }
            Err(e) => {
                error!("matrix allocation failed: {e}");
                slots.wait(POLL_INTERVAL);
            }
        }
    };
    // The identity may have been poisoned while we were blocked on a slot.
    if ctx.blacklist.lock().unwrap().contains(h.engine_id, h.matrix_id) {
        telemetry::BLACKLIST_DROPS.inc();
        debug!(
            "identity ({}, {}) poisoned while waiting; dropping symbol",
            h.engine_id, h.matrix_id
        );
        if fresh {
            ctx.pool.flush(&handle);
        }
        return true;
    }
    let mut m = handle.lock().unwrap();
    if fresh {
        m.max_info_size = h.info_segments_added;
        m.working_t = h.t;
        m.code = Some(code);
        m.feedback_requested = h.has_flag(FLAG_FEEDBACK_REQUEST);
        m.continuous = h.has_flag(FLAG_CONTINUOUS_MODE);
        m.alt_mode = h.has_flag(FLAG_ALT_MODE);
        m.peer = source;
        m.timer.start(ctx.config.window());
        debug!(
            "tracking matrix ({}, {}) as ({}, {}) T={}, {} info segments",
            h.engine_id, h.matrix_id, code.k, code.n, h.t, h.info_segments_added
        );
    } else {
        let consistent = m.code.map_or(false, |c| c.k == h.k && c.n == h.n)
            && m.working_t == h.t
            && m.max_info_size == h.info_segments_added;
        if !consistent {
            warn!(
                "matrix ({}, {}) redeclared as ({}, {}) T={} info={}; discarding it",
                h.engine_id, h.matrix_id, h.k, h.n, h.t, h.info_segments_added
            );
            ctx.blacklist.lock().unwrap().add(h.engine_id, h.matrix_id);
            drop(m);
            ctx.pool.flush(&handle);
            return true;
        }
        if m.cleared_to_codec {
            trace!(
                "late symbol {} for closed matrix ({}, {})",
                h.symbol_id,
                h.engine_id,
                h.matrix_id
            );
            return true;
        }
    }
    if !m.insert_symbol(h.symbol_id, parsed.payload) {
        telemetry::DUPLICATE_SYMBOLS.inc();
        debug!(
            "duplicate symbol {} for matrix ({}, {})",
            h.symbol_id, h.engine_id, h.matrix_id
        );
        return true;
    }
    m.timer.rewind();
    if !(m.is_info_full() || h.symbol_id == h.n - 1) {
        return true;
    }
    m.timer.stop();
    m.cleared_to_codec = true;
    let engine = m.engine_id;
    let global = m.global_id;
    debug!(
        "matrix ({}, {}) closed with {}+{} symbols",
        h.engine_id, h.matrix_id, m.info_count, m.redundancy_count
    );
    drop(m);
    // Head-of-line avoidance: everything strictly older from the same
    // engine closes along with it, preserving approximate arrival order.
    for older in ctx
        .pool
        .collect(|c| c.engine_id == engine && c.global_id < global && !c.cleared_to_codec)
    {
        let mut o = older.lock().unwrap();
        if o.is_empty() || o.cleared_to_codec {
            continue;
        }
        o.timer.stop();
        o.cleared_to_codec = true;
        debug!(
            "force-closing older matrix ({}, {}) with {}+{} symbols",
            o.engine_id, o.matrix_id, o.info_count, o.redundancy_count
        );
    }
    decode.raise();
    true
}

fn decode_worker(ctx: Arc<ReceiverCtx>, waiter: StageWaiter, deliver: StageNotifier) {
    while !ctx.exit.load(Ordering::Relaxed) {
        if waiter.wait(POLL_INTERVAL) == WaitOutcome::Closed {
            break;
        }
        while let Some(handle) = ctx
            .pool
            .next_ready(|m| m.cleared_to_codec && !m.cleared_to_send)
        {
            decode_matrix(&ctx, &handle);
            deliver.raise();
        }
    }
    trace!("decode worker stopped");
}

fn decode_matrix(ctx: &ReceiverCtx, handle: &MatrixHandle) {
    let mut m = handle.lock().unwrap();
    if !m.cleared_to_codec || m.cleared_to_send {
        return;
    }
    match m.code {
        Some(_) if m.info_count >= m.max_info_size => {
            // Every transmitted information symbol arrived; nothing to
            // reconstruct and the outcome stays NotDecoded.
            trace!(
                "matrix ({}, {}) complete without decode",
                m.engine_id,
                m.matrix_id
            );
        }
        Some(code) => {
            let padding = m.max_info_size..code.k;
            let status = ctx.backend.decode(&mut m.codeword, &code, padding);
            m.codec_status = status;
            m.outcome = ctx.backend.status_to_generic(status);
            telemetry::MATRICES_DECODED.inc();
            match m.outcome {
                CodecOutcome::Failed => {
                    telemetry::DECODE_FAILURES.inc();
                    warn!(
                        "decode of matrix ({}, {}) failed with {}+{} of {} symbols: {}",
                        m.engine_id,
                        m.matrix_id,
                        m.info_count,
                        m.redundancy_count,
                        code.n,
                        ctx.backend.status_to_string(status)
                    );
                }
                outcome => {
                    debug!(
                        "matrix ({}, {}) decode: {} with {}+{} of {} symbols",
                        m.engine_id, m.matrix_id, outcome, m.info_count, m.redundancy_count, code.n
                    );
                }
            }
        }
        None => {}
    }
    m.cleared_to_send = true;
}

struct Delivery {
    segments: Vec<Vec<u8>>,
    outcome: CodecOutcome,
    feedback: Option<FeedbackReport>,
    peer: Option<SocketAddr>,
}

/// Gathers everything leaving one matrix while its lock is held. Poisons
/// the identity first so stray late symbols cannot resurrect it.
fn collect_delivery(ctx: &ReceiverCtx, handle: &MatrixHandle) -> Option<Delivery> {
    let m = handle.lock().unwrap();
    if !m.cleared_to_send {
        return None;
    }
    ctx.blacklist.lock().unwrap().add(m.engine_id, m.matrix_id);
    let (k, n) = match m.code {
        Some(code) => (code.k, code.n),
        None => (0, 0),
    };
    let t = m.working_t as usize;
    let mut segments = Vec::new();
    for row_index in 0..k as usize {
        if !m.codeword.is_valid(row_index) {
            continue;
        }
        let row = m.codeword.row(row_index);
        let declared = u16::from_be_bytes([row[0], row[1]]) as usize;
        if declared == 0 {
            continue;
        }
        if declared + LENGTH_PREFIX_LEN > t {
            warn!(
                "row {} of matrix ({}, {}) declares {} bytes beyond its symbol; skipping",
                row_index, m.engine_id, m.matrix_id, declared
            );
            continue;
        }
        segments.push(row[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + declared].to_vec());
    }
    let feedback = if m.feedback_requested {
        Some(FeedbackReport {
            matrix_id: m.matrix_id,
            codec_status: m.codec_status,
            total_segments: m.max_info_size + (n - k),
            received_segments: m.info_count + m.redundancy_count,
        })
    } else {
        None
    };
    debug!(
        "delivering {} segments from matrix ({}, {}) ({})",
        segments.len(),
        m.engine_id,
        m.matrix_id,
        m.outcome
    );
    Some(Delivery {
        segments,
        outcome: m.outcome,
        feedback,
        peer: m.peer,
    })
}

fn deliver_worker(
    ctx: Arc<ReceiverCtx>,
    waiter: StageWaiter,
    upper: Arc<dyn UpperProtocol>,
    lower: Arc<dyn LowerTransport>,
    slots: StageNotifier,
) {
    'outer: while !ctx.exit.load(Ordering::Relaxed) {
        if waiter.wait(POLL_INTERVAL) == WaitOutcome::Closed {
            break;
        }
        while let Some(handle) = ctx.pool.next_ready(|m| m.cleared_to_send) {
            let delivery = match collect_delivery(&ctx, &handle) {
                Some(delivery) => delivery,
                None => continue,
            };
            for segment in &delivery.segments {
                match upper.send_segment(segment, delivery.outcome) {
                    Ok(()) => telemetry::SEGMENTS_DELIVERED.inc(),
                    Err(Error::TransportClosed) => {
                        info!("upper protocol closed; deliver worker exiting");
                        break 'outer;
                    }
                    Err(e) => warn!("segment delivery failed: {e}"),
                }
            }
            if let Some(report) = delivery.feedback {
                let bytes = report.to_bytes();
                for _ in 0..ctx.config.feedback_burst {
                    if let Err(e) = lower.send_packet(&bytes, delivery.peer) {
                        warn!("feedback send failed: {e}");
                        break;
                    }
                }
            }
            if ctx.pool.flush(&handle) {
                slots.raise();
            }
        }
    }
    trace!("deliver worker stopped");
}

fn watchdog_worker(ctx: Arc<ReceiverCtx>, decode: StageNotifier) {
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
            m.cleared_to_codec = true;
            debug!(
                "receive window for matrix ({}, {}) expired with {}+{} symbols",
                m.engine_id, m.matrix_id, m.info_count, m.redundancy_count
            );
            drop(m);
            decode.raise();
        }
    }
    trace!("receiver watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NullCodec;
    use crate::packet::{PacketHeader, WIRE_VERSION};

    fn rx_ctx() -> Arc<ReceiverCtx> {
        let config = Config {
            symbol_len: 64,
            codec: "null".into(),
            static_slots: 4,
            max_dynamic: 2,
            ..Config::default()
        };
        let backend: Arc<dyn CodecBackend> = Arc::new(NullCodec::new());
        let catalog =
            FecCatalog::new(backend.as_ref(), config.symbol_len, true, false, config.k, config.n)
                .unwrap();
        let pool = MatrixPool::new(
            config.static_slots,
            config.max_dynamic,
            catalog.max_n() as usize,
            config.symbol_len as usize,
        )
        .unwrap();
        Arc::new(ReceiverCtx {
            config,
            backend,
            catalog,
            pool,
            blacklist: Mutex::new(Blacklist::new()),
            exit: AtomicBool::new(false),
        })
    }

    fn datagram(
        engine: u16,
        matrix: u16,
        symbol: u16,
        added: u16,
        k: u16,
        n: u16,
        t: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let header = PacketHeader {
            version: WIRE_VERSION,
            ext_count: 0,
            flags: 0,
            engine_id: engine,
            matrix_id: matrix,
            symbol_id: symbol,
            info_segments_added: added,
            k,
            n,
            t,
        };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes);
        bytes.extend_from_slice(payload);
        bytes
    }

    fn info_payload(segment: &[u8]) -> Vec<u8> {
        let mut payload = (segment.len() as u16).to_be_bytes().to_vec();
        payload.extend_from_slice(segment);
        payload
    }

    fn feed(ctx: &ReceiverCtx, bytes: &[u8], decode: &StageNotifier, slots: &StageWaiter) {
        let parsed = packet::parse_packet(bytes).unwrap();
        assert!(process_symbol(ctx, &parsed, None, decode, slots));
    }

    #[test]
    fn fast_path_closes_on_all_transmitted_info() {
        let ctx = rx_ctx();
        let (decode, decode_rx) = stage_signal();
        let (_slot_tx, slots) = stage_signal();
        // Two of two declared segments of a (4, 6) matrix.
        feed(&ctx, &datagram(7, 3, 0, 2, 4, 6, 32, &info_payload(b"aa")), &decode, &slots);
        feed(&ctx, &datagram(7, 3, 1, 2, 4, 6, 32, &info_payload(b"bb")), &decode, &slots);
        assert_eq!(decode_rx.wait(POLL_INTERVAL), WaitOutcome::Raised);

        let handle = ctx.pool.next_ready(|m| m.cleared_to_codec).unwrap();
        let m = handle.lock().unwrap();
        assert_eq!(m.info_count, 2);
        assert!(!m.timer.is_armed());
    }

    #[test]
    fn last_redundancy_symbol_closes_the_matrix() {
        let ctx = rx_ctx();
        let (decode, decode_rx) = stage_signal();
        let (_slot_tx, slots) = stage_signal();
        feed(&ctx, &datagram(7, 4, 0, 4, 4, 6, 32, &info_payload(b"aa")), &decode, &slots);
        assert_eq!(decode_rx.wait(std::time::Duration::from_millis(5)), WaitOutcome::Idle);
        feed(&ctx, &datagram(7, 4, 5, 4, 4, 6, 32, &[9u8; 32]), &decode, &slots);
        assert_eq!(decode_rx.wait(POLL_INTERVAL), WaitOutcome::Raised);
    }

    #[test]
    fn redeclared_geometry_discards_and_blacklists() {
        let ctx = rx_ctx();
        let (decode, _decode_rx) = stage_signal();
        let (_slot_tx, slots) = stage_signal();
        feed(&ctx, &datagram(7, 3, 0, 4, 4, 6, 32, &info_payload(b"aa")), &decode, &slots);
        assert_eq!(ctx.pool.occupied(), 1);
        // Same identity, different N.
        feed(&ctx, &datagram(7, 3, 1, 4, 4, 8, 32, &info_payload(b"bb")), &decode, &slots);
        assert_eq!(ctx.pool.occupied(), 0);
        assert!(ctx.blacklist.lock().unwrap().contains(7, 3));
        // Stray late symbol stays dropped.
        feed(&ctx, &datagram(7, 3, 2, 4, 4, 6, 32, &info_payload(b"cc")), &decode, &slots);
        assert_eq!(ctx.pool.occupied(), 0);
    }

    #[test]
    fn duplicate_symbol_leaves_counters_alone() {
        let ctx = rx_ctx();
        let (decode, _decode_rx) = stage_signal();
        let (_slot_tx, slots) = stage_signal();
        feed(&ctx, &datagram(7, 5, 0, 4, 4, 6, 32, &info_payload(b"aa")), &decode, &slots);
        feed(&ctx, &datagram(7, 5, 0, 4, 4, 6, 32, &info_payload(b"zz")), &decode, &slots);
        let handle = ctx.pool.next_ready(|m| !m.is_empty()).unwrap();
        let m = handle.lock().unwrap();
        assert_eq!(m.info_count, 1);
        // First write wins.
        assert_eq!(&m.codeword.row(0)[2..4], b"aa");
    }

    #[test]
    fn unknown_code_is_dropped_before_any_allocation() {
        let ctx = rx_ctx();
        let (decode, _decode_rx) = stage_signal();
        let (_slot_tx, slots) = stage_signal();
        // (5, 6) is not in the null backend's ladder.
        feed(&ctx, &datagram(7, 6, 0, 5, 5, 6, 32, &info_payload(b"aa")), &decode, &slots);
        assert_eq!(ctx.pool.occupied(), 0);
    }

    #[test]
    fn closing_a_matrix_force_closes_older_same_engine_ones() {
        let ctx = rx_ctx();
        let (decode, _decode_rx) = stage_signal();
        let (_slot_tx, slots) = stage_signal();
        // Three in-progress matrices; engine 7's first two stay open.
        feed(&ctx, &datagram(7, 10, 0, 4, 4, 6, 32, &info_payload(b"aa")), &decode, &slots);
        feed(&ctx, &datagram(7, 11, 0, 4, 4, 6, 32, &info_payload(b"bb")), &decode, &slots);
        feed(&ctx, &datagram(9, 50, 0, 4, 4, 6, 32, &info_payload(b"cc")), &decode, &slots);
        // Last redundancy symbol closes (7, 11) and drags (7, 10) with it.
        feed(&ctx, &datagram(7, 11, 5, 4, 4, 6, 32, &[1u8; 32]), &decode, &slots);

        let closed = ctx.pool.collect(|m| m.cleared_to_codec);
        assert_eq!(closed.len(), 2);
        let other = ctx.pool.collect(|m| m.engine_id == 9);
        assert!(!other[0].lock().unwrap().cleared_to_codec);
    }

    #[test]
    fn decode_fast_path_keeps_not_decoded_outcome() {
        let ctx = rx_ctx();
        let (decode, _decode_rx) = stage_signal();
        let (_slot_tx, slots) = stage_signal();
        feed(&ctx, &datagram(7, 8, 0, 1, 4, 6, 32, &info_payload(b"only")), &decode, &slots);
        let handle = ctx.pool.next_ready(|m| m.cleared_to_codec).unwrap();
        decode_matrix(&ctx, &handle);
        let m = handle.lock().unwrap();
        assert!(m.cleared_to_send);
        assert_eq!(m.outcome, CodecOutcome::NotDecoded);
    }

    #[test]
    fn delivery_blacklists_then_collects_in_symbol_order() {
        let ctx = rx_ctx();
        let (decode, _decode_rx) = stage_signal();
        let (_slot_tx, slots) = stage_signal();
        let mut with_feedback = datagram(7, 9, 0, 2, 4, 6, 32, &info_payload(b"first"));
        with_feedback[2] |= FLAG_FEEDBACK_REQUEST;
        feed(&ctx, &with_feedback, &decode, &slots);
        let mut second = datagram(7, 9, 1, 2, 4, 6, 32, &info_payload(b"second"));
        second[2] |= FLAG_FEEDBACK_REQUEST;
        feed(&ctx, &second, &decode, &slots);

        let handle = ctx.pool.next_ready(|m| m.cleared_to_codec).unwrap();
        decode_matrix(&ctx, &handle);
        let delivery = collect_delivery(&ctx, &handle).unwrap();
        assert!(ctx.blacklist.lock().unwrap().contains(7, 9));
        assert_eq!(delivery.segments.len(), 2);
        assert_eq!(delivery.segments[0], b"first");
        assert_eq!(delivery.segments[1], b"second");
        let report = delivery.feedback.unwrap();
        assert_eq!(report.matrix_id, 9);
        // 2 declared info symbols + 2 redundancy possible, 2 received.
        assert_eq!(report.total_segments, 4);
        assert_eq!(report.received_segments, 2);
    }

    #[test]
    fn empty_and_unrecovered_rows_are_skipped_on_delivery() {
        let ctx = rx_ctx();
        let (decode, _decode_rx) = stage_signal();
        let (_slot_tx, slots) = stage_signal();
        feed(&ctx, &datagram(7, 12, 0, 3, 4, 6, 32, &info_payload(b"kept")), &decode, &slots);
        // Symbol 1 declares an empty segment; symbol 2 never arrives.
        feed(&ctx, &datagram(7, 12, 1, 3, 4, 6, 32, &info_payload(b"")), &decode, &slots);
        let handle = ctx.pool.next_ready(|m| !m.is_empty()).unwrap();
        {
            let mut m = handle.lock().unwrap();
            m.timer.stop();
            m.cleared_to_codec = true;
            m.cleared_to_send = true;
        }
        let delivery = collect_delivery(&ctx, &handle).unwrap();
        assert_eq!(delivery.segments.len(), 1);
        assert_eq!(delivery.segments[0], b"kept");
    }
}
