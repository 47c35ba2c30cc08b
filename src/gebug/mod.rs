//! Gebug module - the application message protocol.
//!
//! Gebug messages ride inside binary transport frames:
//! - Category/command identification with a per-session message id
//! - Declarative, direction-aware parameter schemas
//! - Variable-length blocks with 0xFF/0xFE/0xFD length markers
//! - Multi-packet split and reassembly for bodies over 1 KiB
//! - Reply correlation through the reply-to field
//!
//! # Example
//!
//! ```
//! use gebug_link::gebug::{Direction, GebugMessage, MemoryRead};
//!
//! let request = GebugMessage::from(MemoryRead { address: 0x8000_0400, length: 64, data: vec![] });
//! let packets = request.to_packets(Direction::PcToConsole, 1, None).unwrap();
//! assert_eq!(packets.len(), 1);
//! assert_eq!(packets[0].body.len(), 6);
//! ```

mod category;
mod message;
mod messages;
mod packet;
mod parameter;

pub use category::Category;
pub use message::{decode_parameters, encode_parameters, Envelope, GebugCommand};
pub use messages::*;
pub use packet::{
    flags, GebugPacket, PacketAssembler, PacketSequence, RawMessage, BASE_HEADER_SIZE,
    MAX_PACKET_SIZE,
};
pub use parameter::{
    get_length_marker, put_length_marker, read_parameter, write_parameter, Direction,
    ParamValue, ParameterSize, ParameterSpec, ParameterType, MARKER_U16, MARKER_U32, MARKER_U8,
};
