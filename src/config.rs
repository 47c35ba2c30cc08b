//! Link configuration.
//!
//! All knobs of a [`Connection`](crate::Connection) live in [`LinkConfig`].
//! The struct deserializes from JSON with every field optional, so a config
//! file only needs to name what it overrides:
//!
//! ```
//! use gebug_link::LinkConfig;
//!
//! let config = LinkConfig::from_json_str(r#"{ "handshake_attempts": 3 }"#).unwrap();
//! assert_eq!(config.handshake_attempts, 3);
//! assert_eq!(config.baud_rate, gebug_link::config::DEFAULT_BAUD_RATE);
//! ```
//!
//! Durations are stored as milliseconds and exposed as [`Duration`] through
//! accessor methods.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default timeout for a single transport write.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 2_000;

/// Default serial port read timeout (also bounds how long the reader thread
/// takes to notice a close).
pub const DEFAULT_SERIAL_READ_TIMEOUT_MS: u64 = 100;

/// Default time to wait for `cmdr` after each `cmdt`.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 250;

/// Default number of `cmdt` attempts before the link is declared dead.
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 10;

/// Default pause between handshake attempts.
pub const DEFAULT_HANDSHAKE_RETRY_DELAY_MS: u64 = 50;

/// Default timeout for request/reply helpers.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Default time a partial frame may wait for more bytes.
pub const DEFAULT_FRAME_ASSEMBLY_TIMEOUT_MS: u64 = 200;

/// Default age after which a partial multi-packet message is dropped.
pub const DEFAULT_STALE_ASSEMBLY_MS: u64 = 5_000;

/// Cartridge ROM base address on the console bus.
pub const DEFAULT_ROM_ADDRESS: u32 = 0x1000_0000;

/// Delay between the last ROM chunk and the boot command.
pub const DEFAULT_BOOT_SETTLE_MS: u64 = 500;

/// Default writer queue capacity.
pub const DEFAULT_WRITER_CAPACITY: usize = 256;

/// Default maximum queued outbound items before backpressure.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 256;

/// Default per-subscription delivery queue capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Default maximum accepted transport frame payload.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Configuration for a link session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Timeout for one transport write, in milliseconds.
    pub io_timeout_ms: u64,
    /// Serial port read timeout, in milliseconds.
    pub serial_read_timeout_ms: u64,
    /// Per-attempt handshake timeout, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Number of handshake attempts.
    pub handshake_attempts: u32,
    /// Pause between handshake attempts, in milliseconds.
    pub handshake_retry_delay_ms: u64,
    /// Default request/reply timeout, in milliseconds.
    pub request_timeout_ms: u64,
    /// Partial frame expiry, in milliseconds.
    pub frame_assembly_timeout_ms: u64,
    /// Partial multi-packet message expiry, in milliseconds.
    pub stale_assembly_ms: u64,
    /// ROM upload destination address.
    pub rom_address: u32,
    /// Delay before the boot command, in milliseconds.
    pub boot_settle_ms: u64,
    /// Writer queue capacity.
    pub writer_capacity: usize,
    /// Maximum queued outbound items.
    pub max_pending_writes: usize,
    /// Per-subscription queue capacity.
    pub subscriber_capacity: usize,
    /// Largest accepted transport frame payload.
    pub max_frame_payload: usize,
    /// Serial baud rate.
    pub baud_rate: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            serial_read_timeout_ms: DEFAULT_SERIAL_READ_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            handshake_retry_delay_ms: DEFAULT_HANDSHAKE_RETRY_DELAY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            frame_assembly_timeout_ms: DEFAULT_FRAME_ASSEMBLY_TIMEOUT_MS,
            stale_assembly_ms: DEFAULT_STALE_ASSEMBLY_MS,
            rom_address: DEFAULT_ROM_ADDRESS,
            boot_settle_ms: DEFAULT_BOOT_SETTLE_MS,
            writer_capacity: DEFAULT_WRITER_CAPACITY,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl LinkConfig {
    /// Parse a config from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    #[inline]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    #[inline]
    pub fn serial_read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_read_timeout_ms)
    }

    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[inline]
    pub fn handshake_retry_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_delay_ms)
    }

    #[inline]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[inline]
    pub fn frame_assembly_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_assembly_timeout_ms)
    }

    #[inline]
    pub fn stale_assembly(&self) -> Duration {
        Duration::from_millis(self.stale_assembly_ms)
    }

    #[inline]
    pub fn boot_settle(&self) -> Duration {
        Duration::from_millis(self.boot_settle_ms)
    }

    /// Upper bound on how long [`test_connection`](crate::Connection::test_connection)
    /// may block.
    pub fn handshake_budget(&self) -> Duration {
        let attempts = self.handshake_attempts.max(1);
        self.handshake_timeout() * attempts + self.handshake_retry_delay() * (attempts - 1)
    }
}
