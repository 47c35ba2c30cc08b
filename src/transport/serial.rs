//! Serial port transport.
//!
//! The flashcart enumerates as a USB serial device. Reads run on a dedicated
//! thread that polls the port with the configured read timeout and forwards
//! chunks into the inbound channel; writes run on the blocking pool.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use serialport::SerialPort;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{BoxFuture, Inbound, Transport};
use crate::config::{LinkConfig, DEFAULT_BAUD_RATE, DEFAULT_SERIAL_READ_TIMEOUT_MS};
use crate::error::{LinkError, Result};

/// Size of a single port read.
const READ_CHUNK_SIZE: usize = 4096;

/// Inbound chunks buffered between the reader thread and the receive loop.
const INBOUND_CAPACITY: usize = 256;

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|info| info.port_name)
        .collect())
}

/// Transport over a serial port.
pub struct SerialTransport {
    baud_rate: u32,
    read_timeout: Duration,
    port: Option<SharedPort>,
    stop: Arc<AtomicBool>,
}

impl SerialTransport {
    pub fn new(baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            baud_rate,
            read_timeout,
            port: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(config.baud_rate, config.serial_read_timeout())
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new(
            DEFAULT_BAUD_RATE,
            Duration::from_millis(DEFAULT_SERIAL_READ_TIMEOUT_MS),
        )
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, endpoint: &str) -> Result<Inbound> {
        self.close();

        let port = serialport::new(endpoint, self.baud_rate)
            .timeout(self.read_timeout)
            .open()?;
        let reader = port.try_clone()?;
        info!("Opened serial port {} at {} baud", endpoint, self.baud_rate);

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        self.stop = stop.clone();
        self.port = Some(Arc::new(Mutex::new(port)));

        let name = endpoint.to_string();
        thread::Builder::new()
            .name(format!("serial-reader-{name}"))
            .spawn(move || read_loop(reader, tx, stop, name))?;

        Ok(rx)
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let port = self.port.clone().ok_or(LinkError::NotOpen)?;
            let data = data.to_vec();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut port = port
                    .lock()
                    .map_err(|_| io::Error::other("serial port lock poisoned"))?;
                port.write_all(&data)?;
                port.flush()?;
                Ok(())
            })
            .await
            .map_err(io::Error::other)?
        })
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if self.port.take().is_some() {
            debug!("Serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader thread body. Exits on stop, on a port error, or when the receive
/// loop drops the channel.
fn read_loop(
    mut port: Box<dyn SerialPort>,
    tx: mpsc::Sender<Result<Bytes>>,
    stop: Arc<AtomicBool>,
    name: String,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    while !stop.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Serial read error on {}: {}", name, e);
                let _ = tx.blocking_send(Err(LinkError::Io(e)));
                break;
            }
        }
    }
    debug!("Serial reader for {} stopped", name);
}
