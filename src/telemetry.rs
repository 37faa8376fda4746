use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter, Encoder, Gauge, IntCounter, TextEncoder,
};

lazy_static! {
    pub static ref PACKETS_SENT: IntCounter =
        register_int_counter!("feclink_packets_sent_total", "Coded/uncoded packets sent").unwrap();
    pub static ref PACKETS_RECEIVED: IntCounter = register_int_counter!(
        "feclink_packets_received_total",
        "Packets received from the lower transport"
    )
    .unwrap();
    pub static ref PACKETS_MALFORMED: IntCounter = register_int_counter!(
        "feclink_packets_malformed_total",
        "Packets dropped at deframe time"
    )
    .unwrap();
    pub static ref SEGMENTS_DELIVERED: IntCounter = register_int_counter!(
        "feclink_segments_delivered_total",
        "Segments handed to the upper protocol"
    )
    .unwrap();
    pub static ref MATRICES_ENCODED: IntCounter =
        register_int_counter!("feclink_matrices_encoded_total", "Matrices run through encode").unwrap();
    pub static ref MATRICES_DECODED: IntCounter =
        register_int_counter!("feclink_matrices_decoded_total", "Matrices run through decode").unwrap();
    pub static ref DECODE_FAILURES: IntCounter =
        register_int_counter!("feclink_decode_failures_total", "Decode calls reporting failure").unwrap();
    pub static ref BLACKLIST_DROPS: IntCounter = register_int_counter!(
        "feclink_blacklist_drops_total",
        "Symbols dropped because their identity is blacklisted"
    )
    .unwrap();
    pub static ref DUPLICATE_SYMBOLS: IntCounter = register_int_counter!(
        "feclink_duplicate_symbols_total",
        "Symbol writes rejected as duplicates"
    )
    .unwrap();
    pub static ref FEEDBACK_ACCEPTED: IntCounter =
        register_int_counter!("feclink_feedback_accepted_total", "Valid feedback reports applied").unwrap();
    pub static ref FEEDBACK_REJECTED: IntCounter = register_int_counter!(
        "feclink_feedback_rejected_total",
        "Feedback reports rejected as malformed or out of window"
    )
    .unwrap();
    pub static ref SUCCESS_RATE: Gauge = register_gauge!(
        "feclink_estimated_success_rate",
        "Current EWMA estimate of channel success rate"
    )
    .unwrap();
}

/// Text exposition of all registered metrics. The process exposes no HTTP
/// endpoint of its own; whatever supervises the daemon decides where this
/// goes.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
