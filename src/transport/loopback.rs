//! In-memory transport pair.
//!
//! Bytes written to one end arrive at the other end as one chunk per write.
//! An optional mutator rewrites outbound chunks, which is how tests inject
//! corrupted frames.

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{BoxFuture, Inbound, Transport};
use crate::error::{LinkError, Result};

/// Chunks buffered per direction.
const LOOPBACK_CAPACITY: usize = 1024;

type Mutator = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// One end of an in-memory duplex stream.
pub struct LoopbackTransport {
    peer: Option<mpsc::Sender<Result<Bytes>>>,
    inbound: Option<Inbound>,
    open: bool,
    mutator: Option<Mutator>,
}

impl LoopbackTransport {
    /// Create two cross-connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(LOOPBACK_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(LOOPBACK_CAPACITY);
        (Self::new(b_tx, a_rx), Self::new(a_tx, b_rx))
    }

    fn new(peer: mpsc::Sender<Result<Bytes>>, inbound: Inbound) -> Self {
        Self {
            peer: Some(peer),
            inbound: Some(inbound),
            open: false,
            mutator: None,
        }
    }

    /// Rewrite every outbound chunk with `mutator` before delivery.
    pub fn with_mutator<F>(mut self, mutator: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        self.mutator = Some(Box::new(mutator));
        self
    }
}

impl Transport for LoopbackTransport {
    /// Loopback ends can be opened once; the endpoint is ignored.
    fn open(&mut self, _endpoint: &str) -> Result<Inbound> {
        let inbound = self.inbound.take().ok_or_else(|| {
            LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "loopback end already opened",
            ))
        })?;
        self.open = true;
        Ok(inbound)
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !self.open {
                return Err(LinkError::NotOpen);
            }
            let chunk = match self.mutator.as_mut() {
                Some(mutate) => Bytes::from(mutate(data)),
                None => Bytes::copy_from_slice(data),
            };
            let peer = self.peer.as_ref().ok_or(LinkError::NotOpen)?;
            peer.send(Ok(chunk))
                .await
                .map_err(|_| LinkError::ConnectionClosed)
        })
    }

    fn close(&mut self) {
        self.open = false;
        self.peer = None;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
