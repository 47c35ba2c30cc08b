//! Protocol module - transport framing.
//!
//! This module implements the framing layer of the USB link:
//! - 4-byte kind/length header encoding/decoding
//! - Typed transport frames (text, binary, heartbeat)
//! - Frame buffer for accumulating partial reads and resynchronising
//!   after corrupted headers

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{wrap, Heartbeat, ParsedFrame, TransportFrame, HEARTBEAT_SIZE};
pub use frame_buffer::{FrameBatch, FrameBuffer};
pub use wire_format::{FrameKind, Header, HEADER_SIZE, MAX_FRAME_PAYLOAD};
