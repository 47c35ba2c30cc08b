//! Connection builder and runtime loops.
//!
//! The [`ConnectionBuilder`] provides a fluent API for configuring the link.
//! The [`Connection`] manages the session:
//! 1. Open the transport
//! 2. Spawn the writer task (sole owner of the transport)
//! 3. Spawn the receive loop, which turns inbound bytes into [`LinkEvent`]s
//! 4. Publish events on the connection's message bus
//!
//! # Example
//!
//! ```no_run
//! use gebug_link::gebug::MetaVersion;
//! use gebug_link::transport::SerialTransport;
//! use gebug_link::{Connection, LinkEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::builder(SerialTransport::default())
//!         .handshake_attempts(5)
//!         .start("/dev/ttyUSB0")?;
//!
//!     if !connection.test_connection().await? {
//!         eprintln!("flashcart did not answer");
//!         return Ok(());
//!     }
//!
//!     connection.subscribe(
//!         |event| {
//!             if let LinkEvent::Text(line) = event {
//!                 print!("{line}");
//!             }
//!         },
//!         0,
//!         None,
//!     );
//!
//!     let reply = connection.request(MetaVersion::default(), None).await?;
//!     println!("{:?}", reply.message);
//!
//!     connection.stop();
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{Filter, MessageBus, SubscriptionId};
use crate::config::LinkConfig;
use crate::error::{FramingError, LinkError, ProtocolError, Result};
use crate::flashcart::{words, FlashcartCommand, RomUpload, COMMAND_SIZE};
use crate::gebug::{Direction, Envelope, GebugMessage, GebugPacket, PacketAssembler};
use crate::protocol::{wrap, FrameBatch, FrameBuffer, FrameKind, Heartbeat, TransportFrame};
use crate::transport::{Inbound, Transport};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Link state changes and recoverable errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// The receive loop ended.
    Disconnected { reason: String },
    /// Damaged transport framing was skipped.
    Framing(FramingError),
    /// A Gebug packet or message could not be decoded.
    Protocol(ProtocolError),
    /// A multi-packet message never completed.
    AssemblyExpired { message_id: u16 },
}

/// Everything the receive loop publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message(Envelope),
    Text(String),
    Heartbeat(Heartbeat),
    System(FlashcartCommand),
    Status(LinkStatus),
}

/// Builder for configuring and starting a [`Connection`].
pub struct ConnectionBuilder {
    transport: Box<dyn Transport>,
    config: LinkConfig,
}

impl ConnectionBuilder {
    /// Create a builder for `transport` with default settings.
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Box::new(transport),
            config: LinkConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the timeout for one transport write.
    ///
    /// Default: 2 seconds
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout_ms = millis(timeout);
        self
    }

    /// Set the per-attempt handshake timeout.
    ///
    /// Default: 250 ms
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = millis(timeout);
        self
    }

    /// Set the number of handshake attempts.
    ///
    /// Default: 10
    pub fn handshake_attempts(mut self, attempts: u32) -> Self {
        self.config.handshake_attempts = attempts;
        self
    }

    /// Set the pause between handshake attempts.
    pub fn handshake_retry_delay(mut self, delay: Duration) -> Self {
        self.config.handshake_retry_delay_ms = millis(delay);
        self
    }

    /// Set the default request/reply timeout.
    ///
    /// Default: 1 second
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = millis(timeout);
        self
    }

    /// Set how long a partial frame may wait for more bytes.
    pub fn frame_assembly_timeout(mut self, timeout: Duration) -> Self {
        self.config.frame_assembly_timeout_ms = millis(timeout);
        self
    }

    /// Set the ROM upload address.
    pub fn rom_address(mut self, address: u32) -> Self {
        self.config.rom_address = address;
        self
    }

    /// Set the delay between the last ROM chunk and the boot command.
    ///
    /// Default: 500 ms
    pub fn boot_settle(mut self, delay: Duration) -> Self {
        self.config.boot_settle_ms = millis(delay);
        self
    }

    /// Set the maximum queued writes before backpressure.
    pub fn max_pending_writes(mut self, limit: usize) -> Self {
        self.config.max_pending_writes = limit;
        self
    }

    /// Set the per-subscription queue capacity.
    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.config.subscriber_capacity = capacity;
        self
    }

    /// Set the largest accepted frame payload.
    pub fn max_frame_payload(mut self, size: usize) -> Self {
        self.config.max_frame_payload = size;
        self
    }

    /// Open the transport on `endpoint` and start the session.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self, endpoint: &str) -> Result<Connection> {
        Connection::start(self.transport, self.config, endpoint)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A running link session.
///
/// All methods take `&self`; share the connection with `Arc` to use it from
/// several tasks. Dropping it stops the session.
pub struct Connection {
    config: LinkConfig,
    writer: WriterHandle,
    bus: Arc<MessageBus<LinkEvent>>,
    open: Arc<AtomicBool>,
    next_message_id: AtomicU16,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Create a new connection builder.
    pub fn builder(transport: impl Transport) -> ConnectionBuilder {
        ConnectionBuilder::new(transport)
    }

    fn start(mut transport: Box<dyn Transport>, config: LinkConfig, endpoint: &str) -> Result<Self> {
        let inbound = transport.open(endpoint)?;
        info!("Link opened on {}", endpoint);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (writer, writer_task) = spawn_writer_task(
            transport,
            WriterConfig::from_link_config(&config),
            shutdown_rx.clone(),
        );

        let bus = Arc::new(MessageBus::new(config.subscriber_capacity));
        let open = Arc::new(AtomicBool::new(true));

        let receiver = ReceiveLoop {
            frames: FrameBuffer::with_max_payload(config.max_frame_payload),
            assembler: PacketAssembler::new(config.stale_assembly()),
            bus: bus.clone(),
        };
        let receive_task = tokio::spawn(receiver.run(
            inbound,
            config.frame_assembly_timeout(),
            shutdown_rx,
            open.clone(),
        ));

        let writer_task = tokio::spawn(async move {
            match writer_task.await {
                Ok(Err(e)) => error!("Writer task ended with error: {}", e),
                Err(e) => error!("Writer task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        });

        Ok(Self {
            config,
            writer,
            bus,
            open,
            next_message_id: AtomicU16::new(1),
            shutdown,
            tasks: Mutex::new(vec![receive_task, writer_task]),
        })
    }

    /// Stop both loops and close the transport.
    ///
    /// Safe to call from any task or thread, any number of times.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Stopping link");
        }
        self.open.store(false, Ordering::Release);
    }

    /// Wait until the receive loop and writer task have finished.
    pub async fn closed(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.writer.is_closed()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(LinkError::NotOpen)
        }
    }

    /// Allocate the next message id. Zero is never used.
    fn next_message_id(&self) -> u16 {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a message to the console. Returns its message id.
    pub async fn send_message(&self, message: impl Into<GebugMessage>) -> Result<u16> {
        let id = self.next_message_id();
        self.send_packets(&message.into(), id, None).await?;
        Ok(id)
    }

    /// Send `reply` as the answer to `original`. Returns the reply's id.
    pub async fn send_reply(
        &self,
        reply: impl Into<GebugMessage>,
        original: &Envelope,
    ) -> Result<u16> {
        let id = self.next_message_id();
        self.send_packets(&reply.into(), id, Some(original.message_id))
            .await?;
        Ok(id)
    }

    /// Send `message` and wait for the envelope that replies to it.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub async fn request(
        &self,
        message: impl Into<GebugMessage>,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        let id = self.next_message_id();
        let (subscription, reply) = self.bus.next_matching_with_id(move |event| match event {
            LinkEvent::Message(envelope) => envelope.answers(id),
            LinkEvent::Status(LinkStatus::Disconnected { .. }) => true,
            _ => false,
        });

        if let Err(e) = self.send_packets(&message.into(), id, None).await {
            self.bus.unsubscribe(subscription);
            return Err(e);
        }

        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(LinkEvent::Message(envelope))) => Ok(envelope),
            Ok(_) => Err(LinkError::ConnectionClosed),
            Err(_) => {
                self.bus.unsubscribe(subscription);
                debug!("No reply to message {} within {:?}", id, timeout);
                Err(LinkError::Timeout("reply"))
            }
        }
    }

    async fn send_packets(
        &self,
        message: &GebugMessage,
        message_id: u16,
        reply_to: Option<u16>,
    ) -> Result<()> {
        self.ensure_open()?;
        let packets = message.to_packets(Direction::PcToConsole, message_id, reply_to)?;
        debug!(
            "Sending {} (id {}) in {} packet(s)",
            message.name(),
            message_id,
            packets.len()
        );
        for packet in packets {
            let frame = wrap(FrameKind::Binary, &packet.encode())?;
            self.writer.send(Bytes::from(frame)).await?;
        }
        Ok(())
    }

    /// Send a text frame.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let frame = wrap(FrameKind::Text, text.as_bytes())?;
        self.writer.send(Bytes::from(frame)).await
    }

    /// Send a heartbeat frame.
    pub async fn send_heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        self.ensure_open()?;
        let frame = wrap(FrameKind::Heartbeat, &heartbeat.encode())?;
        self.writer.send(Bytes::from(frame)).await
    }

    /// Send bytes without any framing.
    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.writer.write(Bytes::copy_from_slice(data)).await
    }

    /// Send a flashcart command and wait until it was written.
    pub async fn send_command(&self, command: FlashcartCommand) -> Result<()> {
        self.ensure_open()?;
        self.writer
            .write(Bytes::copy_from_slice(&command.encode()))
            .await
    }

    /// Register a callback for link events. See [`MessageBus::subscribe`].
    pub fn subscribe<F>(
        &self,
        callback: F,
        listen_count: usize,
        filter: Option<Filter<LinkEvent>>,
    ) -> SubscriptionId
    where
        F: Fn(LinkEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback, listen_count, filter)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// The first event after this call that matches `filter`.
    pub fn next_event<P>(&self, filter: P) -> oneshot::Receiver<LinkEvent>
    where
        P: Fn(&LinkEvent) -> bool + Send + Sync + 'static,
    {
        self.bus.next_matching(filter)
    }

    /// Check that the flashcart answers.
    ///
    /// Sends `cmdt` and waits for `cmdr`, retrying up to the configured
    /// number of attempts. A silent cart yields `Ok(false)` after at most
    /// [`LinkConfig::handshake_budget`]; transport errors are returned.
    pub async fn test_connection(&self) -> Result<bool> {
        self.ensure_open()?;
        let attempts = self.config.handshake_attempts.max(1);

        for attempt in 1..=attempts {
            let (subscription, answer) = self.bus.next_matching_with_id(|event| {
                matches!(event, LinkEvent::System(cmd) if cmd.is(words::TEST_RESPONSE))
            });

            if let Err(e) = self.send_command(FlashcartCommand::test()).await {
                self.bus.unsubscribe(subscription);
                return Err(e);
            }

            match tokio::time::timeout(self.config.handshake_timeout(), answer).await {
                Ok(Ok(_)) => {
                    info!("Flashcart answered on attempt {}", attempt);
                    return Ok(true);
                }
                Ok(Err(_)) => return Err(LinkError::ConnectionClosed),
                Err(_) => {
                    self.bus.unsubscribe(subscription);
                    debug!("No handshake response (attempt {}/{})", attempt, attempts);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.handshake_retry_delay()).await;
            }
        }

        warn!("Flashcart did not answer after {} attempts", attempts);
        Ok(false)
    }

    /// Upload a ROM image and boot it.
    ///
    /// Sends `cmdW`, streams the padded image in writes of at most 32 KiB,
    /// waits the boot settle delay, then sends `cmds`. `progress` receives the
    /// percentage written after each chunk reached the transport. Write
    /// failures abort the upload.
    pub async fn send_rom<F>(&self, rom: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(u8),
    {
        let upload = RomUpload::new(rom, self.config.rom_address)?;
        self.ensure_open()?;
        info!(
            "Uploading ROM: {} bytes padded to {} in {} chunk(s)",
            rom.len(),
            upload.padded_size(),
            upload.chunk_count()
        );

        self.send_command(upload.write_command()).await?;

        let mut written = 0;
        for chunk in upload.chunks() {
            written += chunk.len();
            self.writer.write(chunk).await?;
            progress(upload.percent(written));
        }

        tokio::time::sleep(self.config.boot_settle()).await;
        self.send_command(FlashcartCommand::start_rom()).await?;
        info!("ROM upload complete, boot requested");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the receive task.
struct ReceiveLoop {
    frames: FrameBuffer,
    assembler: PacketAssembler,
    bus: Arc<MessageBus<LinkEvent>>,
}

impl ReceiveLoop {
    async fn run(
        mut self,
        mut inbound: Inbound,
        assembly_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
        open: Arc<AtomicBool>,
    ) {
        let reason = loop {
            if *shutdown.borrow() {
                break "stopped".to_string();
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break "stopped".to_string(),
                chunk = recv_with_deadline(&mut inbound, self.frames.has_pending(), assembly_timeout) => chunk,
            };

            match next {
                None => {
                    let batch = self.frames.expire();
                    debug!("Partial frame expired");
                    self.dispatch(batch);
                }
                Some(None) => break "transport closed".to_string(),
                Some(Some(Err(e))) => {
                    error!("Transport read failed: {}", e);
                    break e.to_string();
                }
                Some(Some(Ok(chunk))) => self.handle_chunk(&chunk),
            }

            for message_id in self.assembler.expire_stale(Instant::now()) {
                warn!("Dropped incomplete message {}", message_id);
                self.publish_status(LinkStatus::AssemblyExpired { message_id });
            }
        };

        open.store(false, Ordering::Release);
        info!("Receive loop ended: {}", reason);
        self.publish_status(LinkStatus::Disconnected { reason });
    }

    fn handle_chunk(&mut self, mut chunk: &[u8]) {
        // Commands can share a read with the frames that follow them.
        while self.frames.is_empty() && !chunk.is_empty() {
            let len = chunk.len().min(COMMAND_SIZE);
            let Some(command) = FlashcartCommand::classify(&chunk[..len]) else {
                break;
            };
            debug!("System command {}", command.word_str());
            self.bus.publish(LinkEvent::System(command));
            chunk = &chunk[len..];
        }
        if chunk.is_empty() {
            return;
        }
        let batch = self.frames.push(chunk);
        self.dispatch(batch);
    }

    fn dispatch(&mut self, batch: FrameBatch) {
        for err in batch.errors {
            warn!("Framing error: {}", err);
            self.publish_status(LinkStatus::Framing(err));
        }

        for frame in batch.frames {
            match frame {
                TransportFrame::Text(text) => {
                    self.bus.publish(LinkEvent::Text(text));
                }
                TransportFrame::Heartbeat(heartbeat) => {
                    self.bus.publish(LinkEvent::Heartbeat(heartbeat));
                }
                TransportFrame::Binary(payload) => {
                    if let Err(err) = self.handle_packet(&payload) {
                        warn!("Protocol error: {}", err);
                        self.publish_status(LinkStatus::Protocol(err));
                    }
                }
            }
        }
    }

    fn handle_packet(&mut self, payload: &Bytes) -> std::result::Result<(), ProtocolError> {
        let packet = GebugPacket::parse(payload)?;
        let Some(raw) = self.assembler.push(packet)? else {
            return Ok(());
        };

        let message_id = raw.message_id;
        let reply_to = raw.reply_to;
        let message = GebugMessage::decode(raw, Direction::ConsoleToPc)?;
        debug!("Received {} (id {})", message.name(), message_id);

        self.bus.publish(LinkEvent::Message(Envelope {
            message_id,
            reply_to,
            message,
        }));
        Ok(())
    }

    fn publish_status(&self, status: LinkStatus) {
        self.bus.publish(LinkEvent::Status(status));
    }
}

/// Next inbound chunk. `None` means the partial-frame deadline passed.
async fn recv_with_deadline(
    inbound: &mut Inbound,
    pending: bool,
    deadline: Duration,
) -> Option<Option<Result<Bytes>>> {
    if pending {
        tokio::time::timeout(deadline, inbound.recv()).await.ok()
    } else {
        Some(inbound.recv().await)
    }
}
