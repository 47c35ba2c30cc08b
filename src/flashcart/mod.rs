//! Flashcart module - cart control commands and ROM upload.
//!
//! This layer talks to the flashcart itself rather than the game:
//! - 16-byte command packets (`cmdt`, `cmdr`, `cmdW`, `cmds`)
//! - Fast classification of `cmd?` acknowledgements in the inbound stream
//! - Power-of-two padding and chunking of ROM images

mod command;
mod rom;

pub use command::{
    is_system_command, words, FlashcartCommand, COMMAND_PREFIX, COMMAND_SIZE,
    MIN_SYSTEM_COMMAND_LEN,
};
pub use rom::{pad_size, RomUpload, ROM_UNIT_SIZE, ROM_WRITE_CHUNK};
