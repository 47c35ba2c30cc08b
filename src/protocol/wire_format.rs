//! Wire format encoding and decoding.
//!
//! Implements the 4-byte transport frame header:
//! ```text
//! ┌──────────┬──────────────┬─────────────┬─────────┐
//! │ Kind     │ Length       │ Payload     │ Pad     │
//! │ 1 byte   │ 3 bytes BE   │ N bytes     │ N odd   │
//! └──────────┴──────────────┴─────────────┴─────────┘
//! ```
//!
//! The length field holds the unpadded payload length. Odd payloads are
//! followed by one zero byte so the stream stays 2-byte aligned.

use crate::error::FramingError;

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Largest payload the 24-bit length field can describe.
pub const MAX_FRAME_PAYLOAD: usize = 0x00FF_FFFF;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// ASCII text (console log output).
    Text = 1,
    /// Opaque binary, carries Gebug packets.
    Binary = 2,
    /// Link keepalive with version info.
    Heartbeat = 5,
}

impl FrameKind {
    /// Map a kind byte to a known kind.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            5 => Some(Self::Heartbeat),
            _ => None,
        }
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw kind byte (may be unknown).
    pub kind: u8,
    /// Unpadded payload length in bytes.
    pub payload_length: usize,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: FrameKind, payload_length: usize) -> Self {
        Self {
            kind: kind.as_byte(),
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian length).
    ///
    /// # Panics
    ///
    /// Debug builds assert the length fits in 24 bits; callers validate first.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        debug_assert!(self.payload_length <= MAX_FRAME_PAYLOAD);
        let len = (self.payload_length as u32).to_be_bytes();
        [self.kind, len[1], len[2], len[3]]
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: buf[0],
            payload_length: u32::from_be_bytes([0, buf[1], buf[2], buf[3]]) as usize,
        })
    }

    /// Known kind, if any.
    #[inline]
    pub fn frame_kind(&self) -> Option<FrameKind> {
        FrameKind::from_byte(self.kind)
    }

    /// Number of pad bytes following the payload on the wire.
    #[inline]
    pub fn pad_length(&self) -> usize {
        self.payload_length & 1
    }

    /// Total bytes this frame occupies on the wire, pad included.
    #[inline]
    pub fn wire_length(&self) -> usize {
        HEADER_SIZE + self.payload_length + self.pad_length()
    }

    /// Validate kind and size against a payload limit.
    pub fn validate(&self, max_payload_size: usize) -> Result<FrameKind, FramingError> {
        let kind = self
            .frame_kind()
            .ok_or(FramingError::UnknownKind(self.kind))?;
        if self.payload_length > max_payload_size {
            return Err(FramingError::PayloadTooLarge {
                size: self.payload_length,
                max: max_payload_size,
            });
        }
        Ok(kind)
    }
}
