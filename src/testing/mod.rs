//! Simulated console for tests and tooling.
//!
//! [`FakeConsole`] plays the console side of a [`LoopbackTransport`] pair:
//! it answers the flashcart handshake, swallows ROM uploads and replies to a
//! handful of Gebug requests. The [`mutators`] damage frames on their way to
//! the host.
//!
//! ```no_run
//! use gebug_link::testing::FakeConsole;
//! use gebug_link::transport::LoopbackTransport;
//! use gebug_link::Connection;
//!
//! # async fn demo() -> gebug_link::Result<()> {
//! let (host, console) = LoopbackTransport::pair();
//! let console = FakeConsole::spawn(console)?;
//! let connection = Connection::builder(host).start("loopback")?;
//!
//! assert!(connection.test_connection().await?);
//! assert_eq!(console.log().commands.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! [`LoopbackTransport`]: crate::transport::LoopbackTransport

mod fake_console;
pub mod mutators;

pub use fake_console::{ConsoleLog, FakeConsole, FAKE_TICKS_PER_SECOND, FAKE_VERSION};
