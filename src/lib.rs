//! # gebug-link
//!
//! Host-side link to a console debug build, tunnelled through a USB
//! flashcart's serial port.
//!
//! ## Architecture
//!
//! - **Flashcart plane**: fixed 16-byte `cmd?` packets for the handshake,
//!   ROM upload and boot
//! - **Frame plane**: length-prefixed text, binary and heartbeat frames
//! - **Gebug plane**: typed debugger messages carried in binary frames,
//!   split into packets of at most 1 KiB
//!
//! A [`Connection`] owns the transport. Its receive loop turns inbound bytes
//! into [`LinkEvent`]s published on a per-connection
//! [`MessageBus`](bus::MessageBus); a single writer task serialises
//! everything going out.
//!
//! ## Example
//!
//! ```no_run
//! use gebug_link::gebug::MiscOsTime;
//! use gebug_link::transport::SerialTransport;
//! use gebug_link::{Connection, LinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> gebug_link::Result<()> {
//!     let config = LinkConfig::from_json_file("gebug-link.json")?;
//!     let connection = Connection::builder(SerialTransport::from_config(&config))
//!         .config(config)
//!         .start("/dev/ttyUSB0")?;
//!
//!     if connection.test_connection().await? {
//!         let rom = std::fs::read("build/debug.z64")?;
//!         connection
//!             .send_rom(&rom, |percent| println!("{percent}%"))
//!             .await?;
//!
//!         let reply = connection.request(MiscOsTime::default(), None).await?;
//!         println!("{:?}", reply.message);
//!     }
//!
//!     connection.stop();
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod flashcart;
pub mod gebug;
pub mod protocol;
pub mod testing;
pub mod transport;
pub mod writer;

mod connection;

pub use config::LinkConfig;
pub use connection::{Connection, ConnectionBuilder, LinkEvent, LinkStatus};
pub use error::{FramingError, LinkError, ProtocolError, Result};
