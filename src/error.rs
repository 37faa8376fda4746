use thiserror::Error;

/// Crate-wide error type. Per-packet framing problems have their own
/// [`crate::packet::FrameError`] because they are discard-and-continue
/// conditions, not pipeline failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("matrix storage error: {0}")]
    Storage(String),
    #[error("transport closed")]
    TransportClosed,
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Config(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
