//! Daemon configuration: TOML file plus CLI overrides, validated once at
//! startup. Invalid combinations either abort (class: fatal) or degrade
//! with a warning, so no flag interaction surprises the pipeline later.

use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::codec::CodecBackend;
use crate::error::{Error, Result};
use crate::packet::{HEADER_LEN, MAX_PACKET_LEN};

/// Runtime parameters shared by both daemons. Field defaults describe a
/// moderate-rate link; anything can be overridden from TOML or the CLI.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This sender's engine identity as stamped into every header.
    pub engine_id: u16,
    /// Information symbols per matrix of the default code.
    pub k: u16,
    /// Total symbols per matrix of the default code.
    pub n: u16,
    /// Symbol length T in bytes, including the 2-byte segment length prefix.
    pub symbol_len: u16,
    /// Sender aggregation window before a partial matrix is forced onward.
    pub aggregation_window_ms: u64,
    /// Minimum collected segments for a forced matrix to still be coded.
    pub coding_threshold: u16,
    /// Pick the code per matrix from the estimated channel success rate.
    pub adaptive: bool,
    /// Synthesize N on the fly instead of using catalog entries.
    pub continuous: bool,
    /// Shuffle transmission order to spread burst losses across symbols.
    pub interleave: bool,
    /// Ask the receiver for loss reports.
    pub feedback_request: bool,
    /// Fold loss reports into the success-rate estimate.
    pub feedback_adaptive: bool,
    /// Start matrix numbering at 0 instead of a random offset.
    pub static_mid: bool,
    /// Alternate delivery tagging, carried in the header flags.
    pub alt_mode: bool,
    /// Transmit pacing in bits per second; 0 disables pacing.
    pub tx_rate_bps: u64,
    /// Copies of each feedback report (datagrams are unacknowledged).
    pub feedback_burst: u32,
    /// Matrix pool slots allocated at startup and recycled in place.
    pub static_slots: usize,
    /// Extra pool slots allocated on demand under burst.
    pub max_dynamic: usize,
    /// Codec backend name: "rs8", "rs16" or "null".
    pub codec: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine_id: 1,
            k: 16,
            n: 24,
            symbol_len: 512,
            aggregation_window_ms: 200,
            coding_threshold: 2,
            adaptive: true,
            continuous: false,
            interleave: false,
            feedback_request: false,
            feedback_adaptive: false,
            static_mid: false,
            alt_mode: false,
            tx_rate_bps: 0,
            feedback_burst: 1,
            static_slots: 2,
            max_dynamic: 8,
            codec: "rs8".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.aggregation_window_ms)
    }

    /// Checks the fatal conditions and resolves flag interactions in place.
    pub fn validate(&mut self, backend: &dyn CodecBackend) -> Result<()> {
        if self.k == 0 || self.k >= self.n {
            return Err(Error::Config(format!(
                "default code needs 0 < K < N, got K={} N={}",
                self.k, self.n
            )));
        }
        if self.symbol_len < 4 {
            return Err(Error::Config(format!(
                "symbol length {} is too short for a length prefix and payload",
                self.symbol_len
            )));
        }
        if HEADER_LEN + self.symbol_len as usize > MAX_PACKET_LEN {
            return Err(Error::Config(format!(
                "symbol length {} cannot fit one symbol per datagram",
                self.symbol_len
            )));
        }
        if self.aggregation_window_ms == 0 {
            return Err(Error::Config("aggregation window must be non-zero".into()));
        }
        if self.static_slots == 0 {
            return Err(Error::Config("matrix pool needs at least one static slot".into()));
        }
        if self.feedback_burst == 0 {
            self.feedback_burst = 1;
        }

        if self.feedback_adaptive && !self.feedback_request {
            warn!("feedback_adaptive without feedback_request; requesting feedback");
            self.feedback_request = true;
        }
        if self.continuous && self.adaptive {
            warn!("continuous mode supersedes adaptive code selection; disabling adaptive");
            self.adaptive = false;
        }
        if self.continuous && !backend.supports_continuous_mode() {
            warn!(
                "codec backend {} cannot run continuous mode; disabling it",
                backend.name()
            );
            self.continuous = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NullCodec;

    #[test]
    fn default_config_is_valid() {
        let mut config = Config::default();
        config.validate(&NullCodec::new()).unwrap();
        assert!(config.adaptive);
        assert!(!config.feedback_request);
    }

    #[test]
    fn toml_overrides_selected_fields_only() {
        let config = Config::from_toml(
            "k = 4\nn = 6\nsymbol_len = 128\ninterleave = true\ncodec = \"null\"\n",
        )
        .unwrap();
        assert_eq!(config.k, 4);
        assert_eq!(config.n, 6);
        assert_eq!(config.symbol_len, 128);
        assert!(config.interleave);
        assert_eq!(config.codec, "null");
        // Untouched fields keep their defaults.
        assert_eq!(config.aggregation_window_ms, 200);
        assert_eq!(config.static_slots, 2);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            Config::from_toml("k = \"not a number\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn degenerate_code_is_fatal() {
        let mut config = Config {
            k: 6,
            n: 6,
            ..Config::default()
        };
        assert!(config.validate(&NullCodec::new()).is_err());
        config.k = 0;
        assert!(config.validate(&NullCodec::new()).is_err());
    }

    #[test]
    fn zero_window_and_zero_slots_are_fatal() {
        let mut config = Config {
            aggregation_window_ms: 0,
            ..Config::default()
        };
        assert!(config.validate(&NullCodec::new()).is_err());

        let mut config = Config {
            static_slots: 0,
            ..Config::default()
        };
        assert!(config.validate(&NullCodec::new()).is_err());
    }

    #[test]
    fn feedback_adaptive_pulls_in_feedback_request() {
        let mut config = Config {
            feedback_adaptive: true,
            ..Config::default()
        };
        config.validate(&NullCodec::new()).unwrap();
        assert!(config.feedback_request);
    }

    #[test]
    fn continuous_wins_over_adaptive() {
        let mut config = Config {
            continuous: true,
            adaptive: true,
            ..Config::default()
        };
        config.validate(&NullCodec::new()).unwrap();
        assert!(config.continuous);
        assert!(!config.adaptive);
    }
}
