// Feclink Core Library
//
// This library contains the building blocks of the erasure-coding link
// adapter: codeword matrices and their pool, codec backends, packet
// framing, rate feedback, and the sender/receiver pipelines, consolidated
// into a single crate.

pub mod blacklist;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod feedback;
pub mod matrix;
pub mod packet;
pub mod pipeline;
pub mod pool;
pub mod sequence;
pub mod telemetry;
pub mod timer;
pub mod transport;

pub use error::{Error, Result};
