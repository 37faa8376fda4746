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

//! # Packet Framing
//!
//! Fixed 17-byte big-endian header plus payload. Coded information symbols
//! carry only their declared length (behind a 2-byte in-row prefix);
//! redundancy symbols are transmitted with trailing zeros truncated and are
//! re-padded to T on receive. A header with `K == 0 && N == 0` marks an
//! uncoded single-segment passthrough. The feedback report shares this
//! module because it rides the same datagram transport in the opposite
//! direction.

use thiserror::Error;

pub const WIRE_VERSION: u8 = 0;
pub const HEADER_LEN: usize = 17;
pub const FEEDBACK_LEN: usize = 7;
pub const MAX_PACKET_LEN: usize = 65535;
/// Bytes reserved at the front of each information row for the segment
/// length.
pub const LENGTH_PREFIX_LEN: usize = 2;

pub const FLAG_FEEDBACK_REQUEST: u8 = 0x01;
pub const FLAG_CONTINUOUS_MODE: u8 = 0x02;
pub const FLAG_ALT_MODE: u8 = 0x04;

/// Per-packet problems: log, drop, keep going.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet shorter than its declared layout")]
    Truncated,
    #[error("unsupported wire version {0}")]
    Version(u8),
    #[error("unexpected header extensions ({0})")]
    Extensions(u8),
    #[error("inconsistent header counts (added={added}, K={k}, N={n})")]
    BadCounts { added: u16, k: u16, n: u16 },
    #[error("symbol id {id} out of range for N={n}")]
    SymbolRange { id: u16, n: u16 },
    #[error("payload of {len} bytes exceeds symbol length {t}")]
    PayloadTooLong { len: usize, t: u16 },
    #[error("uncoded length prefix {declared} does not match payload of {actual} bytes")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("packet would exceed the {MAX_PACKET_LEN}-byte datagram limit")]
    Oversize,
    #[error("no catalog code for K={k} N={n}")]
    UnknownCode { k: u16, n: u16 },
    #[error("feedback report shorter than {FEEDBACK_LEN} bytes")]
    TruncatedFeedback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub ext_count: u8,
    pub flags: u8,
    pub engine_id: u16,
    pub matrix_id: u16,
    pub symbol_id: u16,
    pub info_segments_added: u16,
    pub k: u16,
    pub n: u16,
    pub t: u16,
}

impl PacketHeader {
    pub fn is_uncoded(&self) -> bool {
        self.k == 0 && self.n == 0
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.version);
        buf.push(self.ext_count);
        buf.push(self.flags);
        buf.extend_from_slice(&self.engine_id.to_be_bytes());
        buf.extend_from_slice(&self.matrix_id.to_be_bytes());
        buf.extend_from_slice(&self.symbol_id.to_be_bytes());
        buf.extend_from_slice(&self.info_segments_added.to_be_bytes());
        buf.extend_from_slice(&self.k.to_be_bytes());
        buf.extend_from_slice(&self.n.to_be_bytes());
        buf.extend_from_slice(&self.t.to_be_bytes());
    }

    pub fn parse(buf: &[u8]) -> Result<PacketHeader, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let header = PacketHeader {
            version: buf[0],
            ext_count: buf[1],
            flags: buf[2],
            engine_id: u16::from_be_bytes([buf[3], buf[4]]),
            matrix_id: u16::from_be_bytes([buf[5], buf[6]]),
            symbol_id: u16::from_be_bytes([buf[7], buf[8]]),
            info_segments_added: u16::from_be_bytes([buf[9], buf[10]]),
            k: u16::from_be_bytes([buf[11], buf[12]]),
            n: u16::from_be_bytes([buf[13], buf[14]]),
            t: u16::from_be_bytes([buf[15], buf[16]]),
        };
        if header.version != WIRE_VERSION {
            return Err(FrameError::Version(header.version));
        }
        if header.ext_count != 0 {
            return Err(FrameError::Extensions(header.ext_count));
        }
        Ok(header)
    }
}

/// A deframed incoming packet; `payload` borrows the receive buffer.
#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl<'a> ParsedPacket<'a> {
    /// The raw segment of an uncoded packet, behind its length prefix.
    pub fn uncoded_segment(&self) -> &'a [u8] {
        &self.payload[LENGTH_PREFIX_LEN..]
    }
}

/// Validates a datagram into header plus payload. All layout rules are
/// enforced here so the fill worker only deals in well-formed symbols.
pub fn parse_packet(datagram: &[u8]) -> Result<ParsedPacket<'_>, FrameError> {
    let header = PacketHeader::parse(datagram)?;
    let payload = &datagram[HEADER_LEN..];
    if header.is_uncoded() {
        if payload.len() < LENGTH_PREFIX_LEN {
            return Err(FrameError::Truncated);
        }
        let declared = u16::from_be_bytes([payload[0], payload[1]]);
        if declared as usize != payload.len() - LENGTH_PREFIX_LEN {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: payload.len() - LENGTH_PREFIX_LEN,
            });
        }
        return Ok(ParsedPacket { header, payload });
    }
    if header.k == 0 || header.k >= header.n {
        return Err(FrameError::BadCounts {
            added: header.info_segments_added,
            k: header.k,
            n: header.n,
        });
    }
    if header.info_segments_added == 0 || header.info_segments_added > header.k {
        return Err(FrameError::BadCounts {
            added: header.info_segments_added,
            k: header.k,
            n: header.n,
        });
    }
    if header.symbol_id >= header.n {
        return Err(FrameError::SymbolRange {
            id: header.symbol_id,
            n: header.n,
        });
    }
    if payload.len() > header.t as usize {
        return Err(FrameError::PayloadTooLong {
            len: payload.len(),
            t: header.t,
        });
    }
    Ok(ParsedPacket { header, payload })
}

/// Frames an information symbol: the row is transmitted only up to its
/// declared segment length plus the length prefix.
pub fn frame_info_symbol(header: &PacketHeader, row: &[u8]) -> Result<Vec<u8>, FrameError> {
    debug_assert!(row.len() >= LENGTH_PREFIX_LEN);
    let declared = u16::from_be_bytes([row[0], row[1]]) as usize;
    let end = LENGTH_PREFIX_LEN + declared;
    if end > row.len() {
        return Err(FrameError::PayloadTooLong {
            len: end,
            t: row.len() as u16,
        });
    }
    build_packet(header, &row[..end])
}

/// Frames a redundancy symbol with trailing zeros truncated. An all-zero
/// row legitimately frames to an empty payload.
pub fn frame_redundancy_symbol(header: &PacketHeader, row: &[u8]) -> Result<Vec<u8>, FrameError> {
    let end = row.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    build_packet(header, &row[..end])
}

/// Frames an uncoded passthrough packet (header K = N = 0).
pub fn frame_uncoded(header: &PacketHeader, segment: &[u8]) -> Result<Vec<u8>, FrameError> {
    debug_assert!(header.is_uncoded());
    let mut packet = Vec::with_capacity(HEADER_LEN + LENGTH_PREFIX_LEN + segment.len());
    if HEADER_LEN + LENGTH_PREFIX_LEN + segment.len() > MAX_PACKET_LEN {
        return Err(FrameError::Oversize);
    }
    header.write_to(&mut packet);
    packet.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    packet.extend_from_slice(segment);
    Ok(packet)
}

fn build_packet(header: &PacketHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if HEADER_LEN + payload.len() > MAX_PACKET_LEN {
        return Err(FrameError::Oversize);
    }
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    header.write_to(&mut packet);
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Receiver-to-sender loss report, 7 bytes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeedbackReport {
    pub matrix_id: u16,
    pub codec_status: i8,
    pub total_segments: u16,
    pub received_segments: u16,
}

impl FeedbackReport {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.matrix_id.to_be_bytes());
        buf.push(self.codec_status as u8);
        buf.extend_from_slice(&self.total_segments.to_be_bytes());
        buf.extend_from_slice(&self.received_segments.to_be_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FEEDBACK_LEN);
        self.write_to(&mut buf);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<FeedbackReport, FrameError> {
        if buf.len() < FEEDBACK_LEN {
            return Err(FrameError::TruncatedFeedback);
        }
        Ok(FeedbackReport {
            matrix_id: u16::from_be_bytes([buf[0], buf[1]]),
            codec_status: buf[2] as i8,
            total_segments: u16::from_be_bytes([buf[3], buf[4]]),
            received_segments: u16::from_be_bytes([buf[5], buf[6]]),
        })
    }
}
