//! Message catalogue.
//!
//! Positions and coordinates travel as the raw bits of the console's
//! single-precision floats; use `f32::from_bits` to read them.

use super::message::GebugCommand;
use super::packet::{GebugPacket, RawMessage};
use super::parameter::Direction;
use super::Category;
use crate::error::ProtocolError;

crate::gebug_message! {
    /// Liveness check, answered with an empty ping reply.
    MetaPing (Meta, 1) {}

    /// Version of the debug build running on the console.
    MetaVersion (Meta, 2) {
        major: u8 => (1, ConsoleToPc),
        minor: u8 => (2, ConsoleToPc),
        build: u32 => (3, ConsoleToPc),
    }

    /// OS clock in ticks.
    MiscOsTime (Misc, 10) {
        count: u32 => (1, ConsoleToPc),
        ticks_per_second: u32 => (2, ConsoleToPc),
    }

    MiscOsMemoryStats (Misc, 12) {
        free: u32 => (1, ConsoleToPc),
        used: u32 => (2, ConsoleToPc),
        largest_block: u32 => (3, ConsoleToPc),
    }

    /// Read `length` bytes of RAM starting at `address`.
    MemoryRead (Memory, 10) {
        address: u32 => (1, PcToConsole),
        length: u16 => (2, PcToConsole),
        data: Vec<u8> => (3, ConsoleToPc),
    }

    MemoryWrite (Memory, 11) {
        address: u32 => (1, PcToConsole),
        data: Vec<u8> => (2, PcToConsole),
    }

    /// Sent by the console when a stage finishes loading.
    StageNotice (Stage, 10) {
        stage_id: u8 => (1, ConsoleToPc),
    }

    StageRequestLoad (Stage, 11) {
        stage_id: u8 => (1, PcToConsole),
    }

    /// Player position and current room.
    ChrBondPosition (Chr, 10) {
        pos_x: u32 => (1, ConsoleToPc),
        pos_y: u32 => (2, ConsoleToPc),
        pos_z: u32 => (3, ConsoleToPc),
        room: u16 => (4, ConsoleToPc),
    }

    ChrTeleport (Chr, 11) {
        pos_x: u32 => (1, PcToConsole),
        pos_y: u32 => (2, PcToConsole),
        pos_z: u32 => (3, PcToConsole),
        room: u16 => (4, PcToConsole),
    }

    ObjectsNotice (Objects, 10) {
        object_id: u16 => (1, ConsoleToPc),
        state: u32 => (2, ConsoleToPc),
    }

    /// Replace a file in the console's file table.
    FileUpload (File, 10) {
        data: Vec<u8> => (3, PcToConsole),
        name: String => (2, PcToConsole),
        file_id: u16 => (1, Both),
    }

    /// Framebuffer capture, usually split over many packets.
    VideoFrameBuffer (Video, 10) {
        width: u16 => (1, ConsoleToPc),
        height: u16 => (2, ConsoleToPc),
        data: Vec<u8> => (3, ConsoleToPc),
    }

    CheatSet (Cheat, 10) {
        cheat_id: u8 => (1, Both),
    }

    CheatDisable (Cheat, 11) {
        cheat_id: u8 => (1, Both),
    }

    /// Trigger an entry of the in-game debug menu.
    DebugMenuCommand (Debug, 10) {
        menu_item: u8 => (1, PcToConsole),
        /// Compiled in but not sent.
        flags: u32 => (2, Never),
    }

    /// Request the input replay buffer.
    ReplayRequest (Replay, 10) {
        data: Vec<u8> => (1, ConsoleToPc),
    }
}

macro_rules! message_set {
    ($($name:ident),* $(,)?) => {
        /// Every known message, plus the raw form of anything else.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum GebugMessage {
            $($name($name),)*
            /// Unknown category/command pair, kept as received.
            Unrecognized(RawMessage),
        }

        impl GebugMessage {
            pub fn category(&self) -> Category {
                match self {
                    $(Self::$name(_) => $name::CATEGORY,)*
                    Self::Unrecognized(raw) => raw.category,
                }
            }

            pub fn command(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::COMMAND,)*
                    Self::Unrecognized(raw) => raw.command,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$name(_) => $name::NAME,)*
                    Self::Unrecognized(_) => "Unrecognized",
                }
            }

            /// Parameter stream for `direction`. Unrecognized messages are
            /// passed through unchanged.
            pub fn encode_body(&self, direction: Direction) -> Result<Vec<u8>, ProtocolError> {
                match self {
                    $(Self::$name(message) => message.encode_body(direction),)*
                    Self::Unrecognized(raw) => Ok(raw.body.to_vec()),
                }
            }

            /// Decode an assembled message sent in `direction`.
            pub fn decode(raw: RawMessage, direction: Direction) -> Result<Self, ProtocolError> {
                $(
                    if raw.category == $name::CATEGORY && raw.command == $name::COMMAND {
                        return $name::decode_body(&raw.body, direction).map(Self::$name);
                    }
                )*
                Ok(Self::Unrecognized(raw))
            }
        }

        $(
            impl From<$name> for GebugMessage {
                fn from(message: $name) -> Self {
                    Self::$name(message)
                }
            }
        )*
    };
}

message_set! {
    MetaPing,
    MetaVersion,
    MiscOsTime,
    MiscOsMemoryStats,
    MemoryRead,
    MemoryWrite,
    StageNotice,
    StageRequestLoad,
    ChrBondPosition,
    ChrTeleport,
    ObjectsNotice,
    FileUpload,
    VideoFrameBuffer,
    CheatSet,
    CheatDisable,
    DebugMenuCommand,
    ReplayRequest,
}

impl GebugMessage {
    /// Encode for `direction` and split into packets.
    pub fn to_packets(
        &self,
        direction: Direction,
        message_id: u16,
        reply_to: Option<u16>,
    ) -> Result<Vec<GebugPacket>, ProtocolError> {
        RawMessage {
            category: self.category(),
            command: self.command(),
            message_id,
            reply_to,
            body: self.encode_body(direction)?.into(),
        }
        .split()
    }
}
