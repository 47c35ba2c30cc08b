//! Transport module - byte-stream duplex channels.
//!
//! Provides abstraction over:
//! - USB serial ports through the flashcart (`serialport` crate)
//! - In-memory loopback pairs for tests and simulators
//!
//! A transport hands its inbound bytes to the receive loop through the
//! channel returned by [`Transport::open`]. Writes go through
//! [`Transport::write`], which is only ever called by the writer task.

mod loopback;
mod serial;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

pub use loopback::LoopbackTransport;
pub use serial::{available_ports, SerialTransport};

/// Boxed future for transport operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Inbound chunks, or the error that ended the stream.
pub type Inbound = mpsc::Receiver<Result<Bytes>>;

/// A duplex byte stream.
pub trait Transport: Send + 'static {
    /// Open the stream and return the inbound channel.
    ///
    /// The channel closes when the transport closes or the peer goes away.
    fn open(&mut self, endpoint: &str) -> Result<Inbound>;

    /// Write all of `data`.
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Close the stream. Calling it again is harmless.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

impl Transport for Box<dyn Transport> {
    fn open(&mut self, endpoint: &str) -> Result<Inbound> {
        (**self).open(endpoint)
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        (**self).write(data)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
