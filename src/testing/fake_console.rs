//! Console side of a simulated link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::DEFAULT_STALE_ASSEMBLY_MS;
use crate::error::{LinkError, ProtocolError, Result};
use crate::flashcart::{words, FlashcartCommand, COMMAND_PREFIX, COMMAND_SIZE, ROM_UNIT_SIZE};
use crate::gebug::{
    Direction, Envelope, GebugMessage, GebugPacket, MemoryRead, MetaPing, MetaVersion,
    MiscOsMemoryStats, MiscOsTime, PacketAssembler,
};
use crate::protocol::{wrap, FrameBuffer, FrameKind, Heartbeat, TransportFrame};
use crate::transport::Transport;

/// Version reported in answers to [`MetaVersion`].
pub const FAKE_VERSION: (u8, u8, u32) = (1, 4, 2048);

/// Clock rate reported in answers to [`MiscOsTime`].
pub const FAKE_TICKS_PER_SECOND: u32 = 46_875_000;

const INJECT_CAPACITY: usize = 64;

/// Everything the console received so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleLog {
    /// Flashcart commands in arrival order.
    pub commands: Vec<FlashcartCommand>,
    /// Decoded Gebug messages.
    pub envelopes: Vec<Envelope>,
    pub texts: Vec<String>,
    pub heartbeats: Vec<Heartbeat>,
    /// ROM payload bytes received after `cmdW`.
    pub rom: Vec<u8>,
    /// Size of each transport write that carried ROM payload.
    pub rom_writes: Vec<usize>,
    /// Set once `cmds` arrived.
    pub booted: bool,
}

/// A scripted console on one end of a transport.
///
/// The console runs on its own task until [`FakeConsole::stop`] is called,
/// the handle is dropped, or the host closes its end.
pub struct FakeConsole {
    log: Arc<Mutex<ConsoleLog>>,
    silent: Arc<AtomicBool>,
    inject: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl FakeConsole {
    /// Open `transport` and start answering.
    pub fn spawn<T: Transport>(mut transport: T) -> Result<Self> {
        let inbound = transport.open("console")?;
        let log = Arc::new(Mutex::new(ConsoleLog::default()));
        let silent = Arc::new(AtomicBool::new(false));
        let (inject, inject_rx) = mpsc::channel(INJECT_CAPACITY);

        let console = Console {
            frames: FrameBuffer::new(),
            assembler: PacketAssembler::new(Duration::from_millis(DEFAULT_STALE_ASSEMBLY_MS)),
            log: log.clone(),
            silent: silent.clone(),
            rom_remaining: 0,
            next_message_id: 1,
        };
        let task = tokio::spawn(console.run(transport, inbound, inject_rx));

        Ok(Self {
            log,
            silent,
            inject,
            task,
        })
    }

    /// Stop answering the handshake and Gebug requests.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    /// Snapshot of what the console received.
    pub fn log(&self) -> ConsoleLog {
        lock(&self.log).clone()
    }

    /// Poll the log until `check` passes. Returns `false` on timeout.
    pub async fn wait_until<F>(&self, timeout: Duration, check: F) -> bool
    where
        F: Fn(&ConsoleLog) -> bool,
    {
        let start = Instant::now();
        loop {
            if check(&lock(&self.log)) {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Write `bytes` to the host as one transport write.
    pub async fn inject(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.inject
            .send(bytes.into())
            .await
            .map_err(|_| LinkError::ConnectionClosed)
    }

    /// Send an unsolicited message to the host.
    pub async fn send_message(
        &self,
        message: impl Into<GebugMessage>,
        message_id: u16,
        reply_to: Option<u16>,
    ) -> Result<()> {
        let bytes = encode_message(&message.into(), message_id, reply_to)?;
        self.inject(bytes).await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.inject(wrap(FrameKind::Text, text.as_bytes())?).await
    }

    pub async fn send_heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        self.inject(wrap(FrameKind::Heartbeat, &heartbeat.encode())?)
            .await
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for FakeConsole {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(log: &Mutex<ConsoleLog>) -> MutexGuard<'_, ConsoleLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Encode `message` as console-to-host binary frames, back to back.
fn encode_message(
    message: &GebugMessage,
    message_id: u16,
    reply_to: Option<u16>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for packet in message.to_packets(Direction::ConsoleToPc, message_id, reply_to)? {
        out.extend(wrap(FrameKind::Binary, &packet.encode())?);
    }
    Ok(out)
}

struct Console {
    frames: FrameBuffer,
    assembler: PacketAssembler,
    log: Arc<Mutex<ConsoleLog>>,
    silent: Arc<AtomicBool>,
    /// ROM bytes still expected after `cmdW`.
    rom_remaining: usize,
    next_message_id: u16,
}

impl Console {
    async fn run<T: Transport>(
        mut self,
        mut transport: T,
        mut inbound: crate::transport::Inbound,
        mut inject: mpsc::Receiver<Bytes>,
    ) {
        loop {
            let outgoing = tokio::select! {
                chunk = inbound.recv() => match chunk {
                    Some(Ok(chunk)) => self.handle_chunk(&chunk),
                    Some(Err(e)) => {
                        debug!("Console transport failed: {}", e);
                        break;
                    }
                    None => break,
                },
                bytes = inject.recv() => match bytes {
                    Some(bytes) => vec![bytes.to_vec()],
                    None => break,
                },
            };

            for bytes in outgoing {
                if let Err(e) = transport.write(&bytes).await {
                    debug!("Console write failed: {}", e);
                    transport.close();
                    return;
                }
            }
        }
        transport.close();
        debug!("Fake console stopped");
    }

    /// Consume one inbound chunk and return the writes to answer with.
    fn handle_chunk(&mut self, mut chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut outgoing = Vec::new();

        while !chunk.is_empty() {
            if self.rom_remaining > 0 {
                let n = self.rom_remaining.min(chunk.len());
                let mut log = lock(&self.log);
                log.rom.extend_from_slice(&chunk[..n]);
                log.rom_writes.push(n);
                drop(log);
                self.rom_remaining -= n;
                chunk = &chunk[n..];
                continue;
            }

            if self.frames.is_empty()
                && chunk.len() >= COMMAND_SIZE
                && &chunk[..3] == COMMAND_PREFIX
            {
                if let Some(command) = FlashcartCommand::parse(&chunk[..COMMAND_SIZE]) {
                    outgoing.extend(self.handle_command(command));
                }
                chunk = &chunk[COMMAND_SIZE..];
                continue;
            }

            let batch = self.frames.push(chunk);
            for err in batch.errors {
                warn!("Console framing error: {}", err);
            }
            for frame in batch.frames {
                outgoing.extend(self.handle_frame(frame));
            }
            break;
        }
        outgoing
    }

    fn handle_command(&mut self, command: FlashcartCommand) -> Option<Vec<u8>> {
        lock(&self.log).commands.push(command);

        if command.is(words::WRITE_ROM) {
            self.rom_remaining = command.chunk_count() as usize * ROM_UNIT_SIZE;
            let mut log = lock(&self.log);
            log.rom.clear();
            log.rom_writes.clear();
            log.booted = false;
        } else if command.is(words::START_ROM) {
            lock(&self.log).booted = true;
        } else if command.is(words::TEST) && !self.silent.load(Ordering::Relaxed) {
            return Some(FlashcartCommand::test_response().encode().to_vec());
        }
        None
    }

    fn handle_frame(&mut self, frame: TransportFrame) -> Option<Vec<u8>> {
        match frame {
            TransportFrame::Text(text) => lock(&self.log).texts.push(text),
            TransportFrame::Heartbeat(heartbeat) => lock(&self.log).heartbeats.push(heartbeat),
            TransportFrame::Binary(payload) => match self.handle_packet(&payload) {
                Ok(reply) => return reply,
                Err(e) => warn!("Console protocol error: {}", e),
            },
        }
        None
    }

    fn handle_packet(&mut self, payload: &Bytes) -> std::result::Result<Option<Vec<u8>>, ProtocolError> {
        let packet = GebugPacket::parse(payload)?;
        let Some(raw) = self.assembler.push(packet)? else {
            return Ok(None);
        };
        let envelope = Envelope {
            message_id: raw.message_id,
            reply_to: raw.reply_to,
            message: GebugMessage::decode(raw, Direction::PcToConsole)?,
        };

        let reply = if self.silent.load(Ordering::Relaxed) {
            None
        } else {
            answer(&envelope.message)
        };
        let original = envelope.message_id;
        lock(&self.log).envelopes.push(envelope);

        let Some(reply) = reply else {
            return Ok(None);
        };
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        match encode_message(&reply, id, Some(original)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                warn!("Console could not encode {}: {}", reply.name(), e);
                Ok(None)
            }
        }
    }
}

/// The canned answer to a host request, if the console has one.
fn answer(message: &GebugMessage) -> Option<GebugMessage> {
    let reply: GebugMessage = match message {
        GebugMessage::MetaPing(_) => MetaPing {}.into(),
        GebugMessage::MetaVersion(_) => MetaVersion {
            major: FAKE_VERSION.0,
            minor: FAKE_VERSION.1,
            build: FAKE_VERSION.2,
        }
        .into(),
        GebugMessage::MiscOsTime(_) => MiscOsTime {
            count: FAKE_TICKS_PER_SECOND * 3,
            ticks_per_second: FAKE_TICKS_PER_SECOND,
        }
        .into(),
        GebugMessage::MiscOsMemoryStats(_) => MiscOsMemoryStats {
            free: 0x0010_0000,
            used: 0x0030_0000,
            largest_block: 0x0008_0000,
        }
        .into(),
        GebugMessage::MemoryRead(request) => MemoryRead {
            address: request.address,
            length: request.length,
            data: (0..request.length)
                .map(|i| (request.address as u8).wrapping_add(i as u8))
                .collect(),
        }
        .into(),
        _ => return None,
    };
    Some(reply)
}
