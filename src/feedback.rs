//! # Success Rate Estimation
//!
//! The sender folds receiver loss reports into an exponentially weighted
//! moving average of the channel success rate, which the adaptive code
//! selection reads back. Reports are only accepted from a sliding window of
//! matrix ids so that duplicated or long-delayed feedback cannot drag the
//! estimate around; matrix ids wrap at 65536, so the window is tracked in
//! modular arithmetic.

use log::debug;

use crate::catalog::{MAX_SUCCESS_RATE, MIN_SUCCESS_RATE};
use crate::codec::CodecOutcome;
use crate::packet::FeedbackReport;

/// Weight of a fresh sample against the running average.
pub const FEEDBACK_DEFAULT_WEIGHT: f32 = 0.5;
/// Reports covering fewer segments than this weigh in proportionally less.
pub const FEEDBACK_RELIABILITY_THRESHOLD: u16 = 16;

#[derive(Debug)]
pub struct SuccessRateEstimator {
    rate: f32,
    window_lo: u16,
}

impl SuccessRateEstimator {
    /// Seeds the estimate, typically with the configured code's K/N ratio.
    pub fn new(initial_rate: f32, initial_mid: u16) -> Self {
        SuccessRateEstimator {
            rate: initial_rate.clamp(MIN_SUCCESS_RATE, MAX_SUCCESS_RATE),
            window_lo: initial_mid,
        }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// Accepts a report only if its counters are coherent and its matrix id
    /// falls in `[window_lo, window_hi)`, where `window_hi` is the sender's
    /// next unused matrix id.
    pub fn is_valid(&self, report: &FeedbackReport, window_hi: u16) -> bool {
        if report.total_segments == 0 || report.received_segments > report.total_segments {
            return false;
        }
        in_window(report.matrix_id, self.window_lo, window_hi)
    }

    /// Folds an accepted report into the average and advances the window
    /// past it. A failed decode weighs in fully regardless of sample size.
    pub fn apply(&mut self, report: &FeedbackReport, outcome: CodecOutcome) -> f32 {
        let sample = report.received_segments as f32 / report.total_segments as f32;
        let weight = if outcome == CodecOutcome::Failed {
            1.0
        } else if report.total_segments < FEEDBACK_RELIABILITY_THRESHOLD {
            FEEDBACK_DEFAULT_WEIGHT * report.total_segments as f32
                / FEEDBACK_RELIABILITY_THRESHOLD as f32
        } else {
            FEEDBACK_DEFAULT_WEIGHT
        };
        self.rate = (weight * sample + (1.0 - weight) * self.rate)
            .clamp(MIN_SUCCESS_RATE, MAX_SUCCESS_RATE);
        self.window_lo = report.matrix_id.wrapping_add(1);
        debug!(
            "feedback for matrix {}: sample {:.3} weight {:.3} -> rate {:.3}",
            report.matrix_id, sample, weight, self.rate
        );
        self.rate
    }
}

/// Half-open membership test on the u16 ring.
fn in_window(id: u16, lo: u16, hi: u16) -> bool {
    id.wrapping_sub(lo) < hi.wrapping_sub(lo)
}
