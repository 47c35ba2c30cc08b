//! Transport frames with typed payloads.
//!
//! A frame is a tagged payload: text from the console's log, opaque binary
//! carrying Gebug packets, or a heartbeat. Uses `bytes::Bytes` so binary
//! payloads can be handed to the Gebug layer without copying.
//!
//! # Example
//!
//! ```
//! use gebug_link::protocol::{wrap, FrameKind, TransportFrame};
//!
//! let bytes = wrap(FrameKind::Text, b"hello").unwrap();
//! assert_eq!(bytes.len(), 4 + 5 + 1); // header + payload + pad
//!
//! let parsed = TransportFrame::parse(&bytes).unwrap();
//! assert_eq!(parsed.frame, TransportFrame::Text("hello".into()));
//! assert_eq!(parsed.consumed, bytes.len());
//! ```

use bytes::Bytes;

use super::wire_format::{FrameKind, Header, HEADER_SIZE, MAX_FRAME_PAYLOAD};
use crate::error::FramingError;

/// Heartbeat payload size in bytes.
pub const HEARTBEAT_SIZE: usize = 4;

/// Heartbeat payload: protocol and heartbeat versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub protocol_version: u16,
    pub heartbeat_version: u16,
}

impl Heartbeat {
    pub fn encode(&self) -> [u8; HEARTBEAT_SIZE] {
        let p = self.protocol_version.to_be_bytes();
        let h = self.heartbeat_version.to_be_bytes();
        [p[0], p[1], h[0], h[1]]
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        if payload.len() < HEARTBEAT_SIZE {
            return Err(FramingError::MalformedPayload {
                kind: FrameKind::Heartbeat.name(),
                reason: format!("{} bytes, need {}", payload.len(), HEARTBEAT_SIZE),
            });
        }
        Ok(Self {
            protocol_version: u16::from_be_bytes([payload[0], payload[1]]),
            heartbeat_version: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }
}

/// A transport frame with its payload interpreted by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    Binary(Bytes),
    Heartbeat(Heartbeat),
}

/// Result of parsing one frame from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub frame: TransportFrame,
    /// Bytes consumed, including the pad byte when it was present.
    pub consumed: usize,
}

impl TransportFrame {
    /// Frame kind.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Text(_) => FrameKind::Text,
            Self::Binary(_) => FrameKind::Binary,
            Self::Heartbeat(_) => FrameKind::Heartbeat,
        }
    }

    /// Interpret a raw payload according to `kind`.
    pub fn from_payload(kind: FrameKind, payload: Bytes) -> Result<Self, FramingError> {
        Ok(match kind {
            FrameKind::Text => Self::Text(String::from_utf8_lossy(&payload).into_owned()),
            FrameKind::Binary => Self::Binary(payload),
            FrameKind::Heartbeat => Self::Heartbeat(Heartbeat::decode(&payload)?),
        })
    }

    /// Encode this frame for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        match self {
            Self::Text(text) => wrap(FrameKind::Text, text.as_bytes()),
            Self::Binary(data) => wrap(FrameKind::Binary, data),
            Self::Heartbeat(hb) => wrap(FrameKind::Heartbeat, &hb.encode()),
        }
    }

    /// Parse a single frame from the front of `buf`.
    ///
    /// Returns an error and produces no frame when the header is cut short,
    /// the kind is unknown, or the declared length exceeds the bytes present.
    /// A missing pad byte after an odd payload is tolerated.
    pub fn parse(buf: &[u8]) -> Result<ParsedFrame, FramingError> {
        let header = Header::decode(buf).ok_or(FramingError::Truncated {
            available: buf.len(),
            needed: HEADER_SIZE,
        })?;
        let kind = header
            .frame_kind()
            .ok_or(FramingError::UnknownKind(header.kind))?;

        let available = buf.len() - HEADER_SIZE;
        if header.payload_length > available {
            return Err(FramingError::SizeMismatch {
                declared: header.payload_length,
                available,
            });
        }

        let end = HEADER_SIZE + header.payload_length;
        let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..end]);
        let consumed = header.wire_length().min(buf.len());
        Ok(ParsedFrame {
            frame: Self::from_payload(kind, payload)?,
            consumed,
        })
    }
}

/// Wrap a payload in a transport frame.
///
/// Writes kind, 24-bit length, payload, and one zero pad byte if the payload
/// length is odd.
pub fn wrap(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FramingError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }
    let header = Header::new(kind, payload.len());
    let mut buf = Vec::with_capacity(header.wire_length());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf.resize(header.wire_length(), 0);
    Ok(buf)
}
