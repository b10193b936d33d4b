//! Minimal WebSocket envelope used by the device control bus.
//!
//! Only what the device needs: binary data frames out, data/ping/close
//! frames in.  Outbound frames are never masked; inbound frames are unmasked
//! if the peer set the mask bit.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Largest envelope payload accepted from a peer.
pub const DEFAULT_MAX_MESSAGE: usize = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("unsupported websocket opcode 0x{0:X}")]
    BadOpcode(u8),

    #[error("websocket message of {len} bytes exceeds limit of {max}")]
    TooLarge { len: u64, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return None,
        })
    }

    /// Whether the frame carries application bytes.
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Continuation | Opcode::Text | Opcode::Binary)
    }
}

/// One decoded envelope frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsMessage {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Wraps `payload` in a single unmasked, final frame with `opcode`.
pub fn wrap(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 10);
    out.push(0x80 | opcode as u8);
    if len < 126 {
        out.push(len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        out.push(126);
        out.extend_from_slice(&short.to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Wraps `payload` in a binary frame.
pub fn wrap_binary(payload: &[u8]) -> Vec<u8> {
    wrap(Opcode::Binary, payload)
}

/// Reassembles envelope frames from a byte stream.
#[derive(Debug)]
pub struct WsDeframer {
    buf: BytesMut,
    max_message: usize,
}

impl Default for WsDeframer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE)
    }
}

impl WsDeframer {
    pub fn new(max_message: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// An unknown opcode or an oversized frame is unrecoverable for the
    /// stream; the caller should drop the connection.
    pub fn next_message(&mut self) -> Result<Option<WsMessage>, EnvelopeError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];
        let opcode = Opcode::from_bits(b0 & 0x0F).ok_or(EnvelopeError::BadOpcode(b0 & 0x0F))?;
        let masked = b1 & 0x80 != 0;

        let (len, mut header) = match b1 & 0x7F {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]])), 4)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut ext = [0u8; 8];
                ext.copy_from_slice(&self.buf[2..10]);
                (u64::from_be_bytes(ext), 10)
            }
            short => (u64::from(short), 2),
        };
        let len = usize::try_from(len)
            .ok()
            .filter(|&n| n <= self.max_message)
            .ok_or(EnvelopeError::TooLarge { len, max: self.max_message })?;

        let mut key = [0u8; 4];
        if masked {
            if self.buf.len() < header + 4 {
                return Ok(None);
            }
            key.copy_from_slice(&self.buf[header..header + 4]);
            header += 4;
        }
        if self.buf.len() < header + len {
            return Ok(None);
        }

        self.buf.advance(header);
        let mut payload = self.buf.split_to(len);
        if masked {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        Ok(Some(WsMessage {
            fin: b0 & 0x80 != 0,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_uses_shortest_length_form() {
        assert_eq!(&wrap_binary(&[7; 125])[..2], &[0x82, 125]);
        assert_eq!(&wrap_binary(&[7; 126])[..4], &[0x82, 126, 0x00, 0x7E]);
        assert_eq!(
            &wrap_binary(&vec![7; 70_000])[..10],
            &[0x82, 127, 0, 0, 0, 0, 0, 0x01, 0x11, 0x70]
        );
    }

    #[test]
    fn test_deframer_reassembles_split_frame() {
        // Arrange
        let wire = wrap_binary(&[1u8; 300]);
        let mut deframer = WsDeframer::default();

        // Act
        deframer.push(&wire[..3]);
        let early = deframer.next_message().unwrap();
        deframer.push(&wire[3..]);
        let msg = deframer.next_message().unwrap().unwrap();

        // Assert
        assert!(early.is_none());
        assert!(msg.fin);
        assert_eq!(msg.opcode, Opcode::Binary);
        assert_eq!(msg.payload.len(), 300);
        assert!(deframer.next_message().unwrap().is_none());
    }

    #[test]
    fn test_deframer_unmasks_client_frames() {
        // Arrange: "Hello" masked with 37 fa 21 3d (RFC 6455 section 5.7)
        let wire = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let mut deframer = WsDeframer::default();

        // Act
        deframer.push(&wire);
        let msg = deframer.next_message().unwrap().unwrap();

        // Assert
        assert_eq!(msg.opcode, Opcode::Text);
        assert_eq!(msg.payload.as_ref(), b"Hello");
    }

    #[test]
    fn test_deframer_yields_control_frames_in_order() {
        let mut deframer = WsDeframer::default();
        deframer.push(&wrap(Opcode::Ping, b"p"));
        deframer.push(&wrap_binary(b"data"));
        deframer.push(&wrap(Opcode::Close, b""));

        let kinds: Vec<Opcode> = std::iter::from_fn(|| deframer.next_message().unwrap())
            .map(|m| m.opcode)
            .collect();
        assert_eq!(kinds, vec![Opcode::Ping, Opcode::Binary, Opcode::Close]);
    }

    #[test]
    fn test_deframer_rejects_oversized_and_unknown_frames() {
        let mut small = WsDeframer::new(16);
        small.push(&wrap_binary(&[0; 17]));
        assert_eq!(
            small.next_message(),
            Err(EnvelopeError::TooLarge { len: 17, max: 16 })
        );

        let mut bad = WsDeframer::default();
        bad.push(&[0x83, 0x00]);
        assert_eq!(bad.next_message(), Err(EnvelopeError::BadOpcode(3)));
    }
}
