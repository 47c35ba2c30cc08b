//! Fixed 16-byte flashcart command packets.
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ Word     │ Address  │ Chunks   │ Argument │
//! │ 4 ASCII  │ u32 BE   │ u32 BE   │ u32 BE   │
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Unused fields are zero. The cart acknowledges parameterless commands with
//! a short `cmd?` run whose fifth byte is zero; [`is_system_command`] is the
//! fast classifier for those.

use crate::error::{LinkError, Result};

/// Command packet size in bytes (fixed, exactly 16).
pub const COMMAND_SIZE: usize = 16;

/// Prefix shared by every flashcart command word.
pub const COMMAND_PREFIX: &[u8; 3] = b"cmd";

/// Shortest byte run classified as a system command.
pub const MIN_SYSTEM_COMMAND_LEN: usize = 5;

/// Well-known command words.
pub mod words {
    /// Test request.
    pub const TEST: &[u8; 4] = b"cmdt";
    /// Test response.
    pub const TEST_RESPONSE: &[u8; 4] = b"cmdr";
    /// Begin ROM write.
    pub const WRITE_ROM: &[u8; 4] = b"cmdW";
    /// Boot the previously written ROM.
    pub const START_ROM: &[u8; 4] = b"cmds";
}

/// A flashcart command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlashcartCommand {
    word: [u8; 4],
    address: u32,
    chunk_count: u32,
    argument: u32,
}

impl FlashcartCommand {
    /// Build a command from a textual word.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidCommandWord`] unless `word` is exactly four
    /// ASCII bytes.
    pub fn new(word: &str, address: u32, chunk_count: u32, argument: u32) -> Result<Self> {
        let bytes = word.as_bytes();
        if bytes.len() != 4 || !word.is_ascii() {
            return Err(LinkError::InvalidCommandWord(word.to_string()));
        }
        let mut w = [0u8; 4];
        w.copy_from_slice(bytes);
        Ok(Self::from_word(w, address, chunk_count, argument))
    }

    /// Build a command from a word that is already known to be valid.
    pub const fn from_word(word: [u8; 4], address: u32, chunk_count: u32, argument: u32) -> Self {
        Self {
            word,
            address,
            chunk_count,
            argument,
        }
    }

    /// `cmdt`.
    pub const fn test() -> Self {
        Self::from_word(*words::TEST, 0, 0, 0)
    }

    /// `cmdr`.
    pub const fn test_response() -> Self {
        Self::from_word(*words::TEST_RESPONSE, 0, 0, 0)
    }

    /// `cmdW` for an image of `padded_size` bytes at `address`.
    pub const fn write_rom(address: u32, padded_size: u32) -> Self {
        Self::from_word(
            *words::WRITE_ROM,
            address,
            padded_size / super::rom::ROM_UNIT_SIZE as u32,
            0,
        )
    }

    /// `cmds`.
    pub const fn start_rom() -> Self {
        Self::from_word(*words::START_ROM, 0, 0, 0)
    }

    /// Encode to the 16-byte wire form.
    ///
    /// # Example
    ///
    /// ```
    /// use gebug_link::flashcart::FlashcartCommand;
    ///
    /// let bytes = FlashcartCommand::new("cmdW", 0x1000_0000, 2, 0).unwrap().encode();
    /// assert_eq!(&bytes[..4], b"cmdW");
    /// assert_eq!(&bytes[4..8], &[0x10, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; COMMAND_SIZE] {
        let mut buf = [0u8; COMMAND_SIZE];
        buf[0..4].copy_from_slice(&self.word);
        buf[4..8].copy_from_slice(&self.address.to_be_bytes());
        buf[8..12].copy_from_slice(&self.chunk_count.to_be_bytes());
        buf[12..16].copy_from_slice(&self.argument.to_be_bytes());
        buf
    }

    /// Decode an explicit command record.
    ///
    /// Accepts 4..=16 bytes; missing trailing fields read as zero. Unlike
    /// [`FlashcartCommand::classify`] this also accepts parameterised
    /// commands such as `cmdW`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 || bytes.len() > COMMAND_SIZE || &bytes[..3] != COMMAND_PREFIX {
            return None;
        }
        let mut buf = [0u8; COMMAND_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        let field = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Some(Self {
            word: [buf[0], buf[1], buf[2], buf[3]],
            address: field(4),
            chunk_count: field(8),
            argument: field(12),
        })
    }

    /// Classify an inbound byte run as a parameterless system command.
    pub fn classify(bytes: &[u8]) -> Option<Self> {
        if is_system_command(bytes) {
            Self::parse(bytes)
        } else {
            None
        }
    }

    #[inline]
    pub fn word(&self) -> &[u8; 4] {
        &self.word
    }

    /// Command word as text (always ASCII for constructed commands).
    pub fn word_str(&self) -> String {
        String::from_utf8_lossy(&self.word).into_owned()
    }

    #[inline]
    pub fn address(&self) -> u32 {
        self.address
    }

    #[inline]
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    #[inline]
    pub fn argument(&self) -> u32 {
        self.argument
    }

    #[inline]
    pub fn is(&self, word: &[u8; 4]) -> bool {
        &self.word == word
    }
}

/// True when `bytes` is a parameterless `cmd?` acknowledgement.
///
/// The write-ROM command carries a non-zero address at offset 4 and is
/// deliberately not matched here.
pub fn is_system_command(bytes: &[u8]) -> bool {
    (MIN_SYSTEM_COMMAND_LEN..=COMMAND_SIZE).contains(&bytes.len())
        && &bytes[..3] == COMMAND_PREFIX
        && bytes[4] == 0
}
