//! Dedicated writer task for outbound bytes.
//!
//! The writer task owns the transport. Everything that goes to the console,
//! whether Gebug frames, flashcart commands or ROM chunks, is queued through
//! a [`WriterHandle`], so writes are never interleaved.
//!
//! # Architecture
//!
//! ```text
//! Connection ─┐
//! send_rom   ─┼─► mpsc::Sender<OutboundWrite> ─► Writer Task ─► Transport
//! Handshake  ─┘
//! ```
//!
//! Small items that are ready together are coalesced into one transport
//! write of at most [`MAX_WRITE_SIZE`] bytes. Callers that need to know when
//! their bytes reached the transport use [`WriterHandle::write`], which waits
//! for an acknowledgement.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::{
    LinkConfig, DEFAULT_IO_TIMEOUT_MS, DEFAULT_MAX_PENDING_WRITES, DEFAULT_WRITER_CAPACITY,
};
use crate::error::{LinkError, Result};
use crate::flashcart::ROM_WRITE_CHUNK;
use crate::transport::Transport;

/// Largest single transport write.
pub const MAX_WRITE_SIZE: usize = ROM_WRITE_CHUNK;

/// Maximum items to batch in a single pass.
const MAX_BATCH_SIZE: usize = 64;

type Ack = oneshot::Sender<Result<()>>;

/// Bytes queued for the transport.
#[derive(Debug)]
pub struct OutboundWrite {
    pub data: Bytes,
    /// Completed once `data` was handed to the transport.
    ack: Option<Ack>,
}

impl OutboundWrite {
    /// Create a fire-and-forget write.
    #[inline]
    pub fn new(data: Bytes) -> Self {
        Self { data, ack: None }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum queued items before backpressure kicks in.
    pub max_pending_writes: usize,
    /// Channel capacity for the write queue.
    pub channel_capacity: usize,
    /// Timeout for one transport write, also used when waiting for
    /// backpressure to clear.
    pub io_timeout: Duration,
}

impl WriterConfig {
    pub fn from_link_config(config: &LinkConfig) -> Self {
        Self {
            max_pending_writes: config.max_pending_writes,
            channel_capacity: config.writer_capacity,
            io_timeout: config.io_timeout(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            channel_capacity: DEFAULT_WRITER_CAPACITY,
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
        }
    }
}

/// Handle for queueing writes.
///
/// This is cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for writes.
    tx: mpsc::Sender<OutboundWrite>,
    /// Pending item count (for backpressure).
    pending: Arc<AtomicUsize>,
    /// Maximum pending items.
    max_pending: usize,
    /// Backpressure timeout.
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundWrite>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue `data` without waiting for it to be written.
    ///
    /// Waits if backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.enqueue(OutboundWrite::new(data)).await
    }

    /// Queue `data` and wait until the transport accepted it.
    ///
    /// Transport errors for this write are returned here.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(OutboundWrite {
            data,
            ack: Some(ack_tx),
        })
        .await?;
        ack_rx.await.map_err(|_| LinkError::ConnectionClosed)?
    }

    async fn enqueue(&self, item: OutboundWrite) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Reserve the slot before queueing.
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(item).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            LinkError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_millis(1);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(LinkError::ConnectionClosed);
            }
            if start.elapsed() > self.timeout {
                return Err(LinkError::Timeout("writer backpressure"));
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending item count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for queueing writes.
///
/// The task ends when `shutdown` turns true, when every handle is dropped, or
/// on the first failed write. In all cases it closes the transport; queued
/// items are dropped and their waiters see [`LinkError::ConnectionClosed`].
pub fn spawn_writer_task<T>(
    transport: T,
    config: WriterConfig,
    shutdown: watch::Receiver<bool>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    T: Transport,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_writes.max(1),
        config.io_timeout,
    );

    let task = tokio::spawn(writer_loop(
        rx,
        transport,
        pending,
        config.io_timeout,
        shutdown,
    ));

    (handle, task)
}

async fn writer_loop<T: Transport>(
    mut rx: mpsc::Receiver<OutboundWrite>,
    mut transport: T,
    pending: Arc<AtomicUsize>,
    io_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let result = loop {
        if *shutdown.borrow() {
            break Ok(());
        }

        // A dropped shutdown sender also stops the writer.
        let first = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            item = rx.recv() => item,
        };
        let Some(first) = first else {
            break Ok(());
        };

        // Collect additional ready items (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let written = tokio::select! {
            biased;
            _ = shutdown.changed() => Ok(()),
            r = write_batch(&mut transport, batch, io_timeout) => r,
        };
        pending.fetch_sub(batch_size, Ordering::Release);

        if let Err(e) = written {
            error!("Transport write failed: {}", e);
            break Err(e);
        }
    };

    rx.close();
    transport.close();
    debug!("Writer task stopped");
    result
}

/// Write a batch, coalescing neighbours up to [`MAX_WRITE_SIZE`].
async fn write_batch<T: Transport>(
    transport: &mut T,
    batch: Vec<OutboundWrite>,
    io_timeout: Duration,
) -> Result<()> {
    let mut group: Vec<OutboundWrite> = Vec::new();
    let mut group_size = 0;

    for item in batch {
        if !group.is_empty() && group_size + item.size() > MAX_WRITE_SIZE {
            write_group(transport, std::mem::take(&mut group), io_timeout).await?;
            group_size = 0;
        }
        group_size += item.size();
        group.push(item);
    }
    if !group.is_empty() {
        write_group(transport, group, io_timeout).await?;
    }
    Ok(())
}

/// Write one group as a single transport write and complete its acks.
async fn write_group<T: Transport>(
    transport: &mut T,
    group: Vec<OutboundWrite>,
    io_timeout: Duration,
) -> Result<()> {
    let data = if group.len() == 1 {
        group[0].data.clone()
    } else {
        let mut buf = BytesMut::with_capacity(group.iter().map(OutboundWrite::size).sum());
        for item in &group {
            buf.extend_from_slice(&item.data);
        }
        buf.freeze()
    };

    let result = match tokio::time::timeout(io_timeout, transport.write(&data)).await {
        Ok(r) => r,
        Err(_) => Err(LinkError::Timeout("transport write")),
    };

    for ack in group.into_iter().filter_map(|item| item.ack) {
        let _ = ack.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(e.duplicate()),
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Inbound, LoopbackTransport};

    fn open_pair() -> (LoopbackTransport, LoopbackTransport, Inbound) {
        let (mut host, mut console) = LoopbackTransport::pair();
        host.open("").unwrap();
        let inbound = console.open("").unwrap();
        (host, console, inbound)
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_writes, DEFAULT_MAX_PENDING_WRITES);
        assert_eq!(config.channel_capacity, DEFAULT_WRITER_CAPACITY);
        assert_eq!(config.io_timeout, Duration::from_millis(DEFAULT_IO_TIMEOUT_MS));
    }

    #[tokio::test]
    async fn test_write_waits_for_transport() {
        let (host, _console, mut inbound) = open_pair();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, _task) = spawn_writer_task(host, WriterConfig::default(), stop_rx);

        handle.write(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(
            inbound.recv().await.unwrap().unwrap(),
            Bytes::from_static(b"hello")
        );
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ordering_and_coalescing() {
        let (host, _console, mut inbound) = open_pair();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, _task) = spawn_writer_task(host, WriterConfig::default(), stop_rx);

        for i in 0..10u8 {
            handle.send(Bytes::from(vec![i; 4])).await.unwrap();
        }
        handle.write(Bytes::new()).await.unwrap();

        let mut all = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(20), inbound.recv()).await
        {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= MAX_WRITE_SIZE);
            all.extend_from_slice(&chunk);
        }
        let expected: Vec<u8> = (0..10u8).flat_map(|i| [i; 4]).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn test_large_items_not_merged() {
        let (host, _console, mut inbound) = open_pair();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, _task) = spawn_writer_task(host, WriterConfig::default(), stop_rx);

        handle.send(Bytes::from(vec![1u8; MAX_WRITE_SIZE])).await.unwrap();
        handle.write(Bytes::from(vec![2u8; MAX_WRITE_SIZE])).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap().unwrap().len(), MAX_WRITE_SIZE);
        assert_eq!(inbound.recv().await.unwrap().unwrap().len(), MAX_WRITE_SIZE);
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport() {
        let (host, _console, mut inbound) = open_pair();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (handle, task) = spawn_writer_task(host, WriterConfig::default(), stop_rx);

        stop_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(inbound.recv().await.is_none());
        assert!(matches!(
            handle.write(Bytes::from_static(b"late")).await,
            Err(LinkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_error_reported_to_waiter() {
        let (mut host, console) = LoopbackTransport::pair();
        host.open("").unwrap();
        drop(console);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, task) = spawn_writer_task(host, WriterConfig::default(), stop_rx);

        assert!(matches!(
            handle.write(Bytes::from_static(b"x")).await,
            Err(LinkError::ConnectionClosed)
        ));
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_on_handle_drop() {
        let (host, _console, _inbound) = open_pair();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (handle, task) = spawn_writer_task(host, WriterConfig::default(), stop_rx);

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}
