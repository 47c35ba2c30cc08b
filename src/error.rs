//! Error types for gebug-link.
//!
//! Each layer of the stack has its own error enum so the receive loop can
//! tell recoverable stream damage ([`FramingError`], [`ProtocolError`]) apart
//! from a dead link ([`LinkError::Io`], [`LinkError::ConnectionClosed`]).

use thiserror::Error;

/// Errors raised while splitting the byte stream into transport frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Fewer bytes than a frame header.
    #[error("Truncated frame: {available} bytes, header needs {needed}")]
    Truncated { available: usize, needed: usize },

    /// Declared payload length exceeds the bytes that are actually there.
    #[error("Size mismatch: declared {declared} bytes, {available} available")]
    SizeMismatch { declared: usize, available: usize },

    /// Kind byte is not text, binary or heartbeat.
    #[error("Unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    /// Payload is too short or otherwise invalid for its kind.
    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },

    /// Payload does not fit the 24-bit length field or the configured maximum.
    #[error("Payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Errors raised while decoding Gebug packets and messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Packet is shorter than its header claims.
    #[error("Truncated packet header: {available} bytes, need {needed}")]
    TruncatedHeader { available: usize, needed: usize },

    /// Parameter stream ended in the middle of a parameter.
    #[error("Truncated parameter `{name}`: need {needed} bytes, {available} left")]
    TruncatedParameter {
        name: &'static str,
        needed: usize,
        available: usize,
    },

    /// Variable-size parameter not preceded by 0xFF, 0xFE or 0xFD.
    #[error("Invalid length marker 0x{marker:02x} for parameter `{name}`")]
    InvalidLengthMarker { name: &'static str, marker: u8 },

    /// Bytes left over after the last declared parameter.
    #[error("{count} trailing bytes after parameter stream")]
    TrailingBytes { count: usize },

    /// Value does not fit its declared wire size.
    #[error("Value {value} does not fit parameter `{name}`")]
    ValueTooLarge { name: &'static str, value: u64 },

    /// Parameter value has a different shape than the schema declares.
    #[error("Parameter `{name}` has the wrong type")]
    TypeMismatch { name: &'static str },

    /// Multi-packet message numbering is inconsistent.
    #[error("Bad packet sequence for message {message_id}: {reason}")]
    BadSequence { message_id: u16, reason: String },
}

/// Main error type for all link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Configuration file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport framing error.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Gebug protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Flashcart command word is not exactly four ASCII bytes.
    #[error("Invalid flashcart command word: {0:?}")]
    InvalidCommandWord(String),

    /// ROM image cannot be uploaded.
    #[error("Invalid ROM image: {0}")]
    InvalidRom(String),

    /// Operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// Operation requires an open connection.
    #[error("Connection is not open")]
    NotOpen,

    /// Connection closed while the operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl LinkError {
    /// A copy of this error for reporting to more than one waiter.
    pub(crate) fn duplicate(&self) -> LinkError {
        match self {
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Framing(e) => Self::Framing(e.clone()),
            Self::Protocol(e) => Self::Protocol(e.clone()),
            Self::InvalidCommandWord(word) => Self::InvalidCommandWord(word.clone()),
            Self::InvalidRom(reason) => Self::InvalidRom(reason.clone()),
            Self::Timeout(what) => Self::Timeout(what),
            Self::NotOpen => Self::NotOpen,
            Self::Serial(_) | Self::Json(_) | Self::ConnectionClosed => Self::ConnectionClosed,
        }
    }
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;
