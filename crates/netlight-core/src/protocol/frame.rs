//! Wire framing: frame construction, CRC-16, and the incremental parser.
//!
//! Wire format:
//! ```text
//! [sof:2 "NL"][version:1][addr:2][cmd:2][len:2][payload:len][crc:2]
//! ```
//! All multi-byte integers are little-endian, the checksum included.  The
//! checksum covers `version` through the last payload byte; the start marker
//! is excluded.
//!
//! # Resynchronisation (for beginners)
//!
//! A byte stream has no built-in message boundaries, and a single flipped bit
//! can make a length field lie.  [`FrameParser`] never trusts a candidate frame
//! until its checksum matches.  Whenever a candidate turns out to be bogus
//! (wrong version, impossible length, bad checksum) the parser drops exactly
//! *one* byte and scans again for `"NL"`.  Dropping only one byte guarantees
//! that a good frame hiding inside the rejected candidate is still found.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

/// Two-byte ASCII tag that opens every frame.
pub const START_MARKER: [u8; 2] = *b"NL";

/// Current protocol version carried in byte 2 of every frame.
pub const PROTOCOL_VERSION: u8 = 3;

/// Destination address meaning "every device".
pub const ADDR_BROADCAST: u16 = 0xFFFF;

/// Default upper bound on the payload length a parser accepts.
pub const DEFAULT_MAX_PAYLOAD: usize = 8192;

/// Size of the fixed header (marker, version, address, command, length).
pub const HEADER_SIZE: usize = 9;

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 2;

/// Errors raised while *building* a frame.
///
/// Parsing never fails; malformed input is skipped and counted instead.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// The payload does not fit the 16-bit length field.
    #[error("payload of {len} bytes does not fit a frame (limit {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

// ── CRC ───────────────────────────────────────────────────────────────────────

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, MSB-first, no final XOR.
///
/// ```rust
/// assert_eq!(netlight_core::crc16(b"123456789"), 0x29B1);
/// ```
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One complete, checksum-verified protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub addr: u16,
    pub cmd: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Returns `true` if the frame is addressed to every device.
    pub fn is_broadcast(&self) -> bool {
        self.addr == ADDR_BROADCAST
    }
}

/// Builds `header || payload || checksum` for one frame.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if `payload` is longer than the
/// 16-bit length field can express.
///
/// # Examples
///
/// ```rust
/// use netlight_core::{pack, FrameParser};
///
/// let bytes = pack(0x1003, b"", 0xFFFF).unwrap();
/// let mut parser = FrameParser::new();
/// parser.feed(&bytes);
/// let frame = parser.try_parse_one().unwrap();
/// assert_eq!(frame.cmd, 0x1003);
/// ```
pub fn pack(cmd: u16, payload: &[u8], addr: u16) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        len: payload.len(),
        max: usize::from(u16::MAX),
    })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    buf.extend_from_slice(&START_MARKER);
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&addr.to_le_bytes());
    buf.extend_from_slice(&cmd.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);

    let crc = crc16(&buf[START_MARKER.len()..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// Counters describing what the parser has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Frames returned to the caller.
    pub frames: u64,
    /// Candidates rejected for a wrong version byte.
    pub bad_version: u64,
    /// Candidates rejected for a length above the configured maximum.
    pub bad_length: u64,
    /// Candidates rejected for a checksum mismatch.
    pub bad_checksum: u64,
    /// Bytes thrown away while hunting for a start marker or resyncing.
    pub discarded_bytes: u64,
}

/// Incremental frame parser over an append-only inbound buffer.
///
/// Feed it reads of any size with [`feed`](Self::feed); pull complete frames
/// with [`try_parse_one`](Self::try_parse_one) or [`pop`](Self::pop).
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    max_payload: usize,
    stats: ParserStats,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Creates a parser accepting payloads up to [`DEFAULT_MAX_PAYLOAD`].
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Creates a parser with a custom payload limit.
    ///
    /// The limit is clamped to what the 16-bit length field can carry.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(HEADER_SIZE + CHECKSUM_SIZE + 256),
            max_payload: max_payload.min(usize::from(u16::MAX)),
            stats: ParserStats::default(),
        }
    }

    /// Appends raw bytes received from a transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes currently buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Configured payload limit.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Snapshot of the parser counters.
    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Discards everything buffered, e.g. after a transport reconnect.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Attempts to extract the next complete frame.
    ///
    /// Returns `None` when more bytes are needed.  Garbage and corrupted
    /// candidates are skipped internally and never surface as errors.
    pub fn try_parse_one(&mut self) -> Option<Frame> {
        loop {
            match find_marker(&self.buf) {
                Some(0) => {}
                Some(idx) => self.discard(idx),
                None => {
                    // A lone trailing 'N' may be the first half of a split marker.
                    let keep = usize::from(self.buf.last() == Some(&START_MARKER[0]));
                    let drop = self.buf.len() - keep;
                    if drop > 0 {
                        self.discard(drop);
                    }
                    return None;
                }
            }

            if self.buf.len() < HEADER_SIZE {
                return None;
            }

            let version = self.buf[2];
            let addr = u16::from_le_bytes([self.buf[3], self.buf[4]]);
            let cmd = u16::from_le_bytes([self.buf[5], self.buf[6]]);
            let len = usize::from(u16::from_le_bytes([self.buf[7], self.buf[8]]));

            if version != PROTOCOL_VERSION {
                debug!("frame resync: version {version} != {PROTOCOL_VERSION}");
                self.stats.bad_version += 1;
                self.discard(1);
                continue;
            }
            if len > self.max_payload {
                debug!("frame resync: length {len} exceeds {}", self.max_payload);
                self.stats.bad_length += 1;
                self.discard(1);
                continue;
            }

            let total = HEADER_SIZE + len + CHECKSUM_SIZE;
            if self.buf.len() < total {
                return None;
            }

            let body_end = HEADER_SIZE + len;
            let received = u16::from_le_bytes([self.buf[body_end], self.buf[body_end + 1]]);
            let computed = crc16(&self.buf[START_MARKER.len()..body_end]);
            if received != computed {
                warn!(
                    "frame resync: crc mismatch for cmd 0x{cmd:04X} \
                     (got 0x{received:04X}, want 0x{computed:04X})"
                );
                self.stats.bad_checksum += 1;
                self.discard(1);
                continue;
            }

            let raw = self.buf.split_to(total).freeze();
            self.stats.frames += 1;
            return Some(Frame {
                version,
                addr,
                cmd,
                payload: raw.slice(HEADER_SIZE..body_end),
            });
        }
    }

    /// Drains every complete frame currently buffered.
    pub fn pop(&mut self) -> impl Iterator<Item = Frame> + '_ {
        std::iter::from_fn(move || self.try_parse_one())
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.stats.discarded_bytes += n as u64;
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(START_MARKER.len())
        .position(|window| window == START_MARKER)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
