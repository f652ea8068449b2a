use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;
use serialport::SerialPort;

use crate::drivers::error::TransportError;

/// Byte stream to the acquisition hardware.
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), TransportError>;
    fn close(&mut self);
    fn is_connected(&self) -> bool;
    /// Reads at most `max_bytes`. An empty result means the timeout elapsed.
    fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Names of the serial ports the OS currently reports.
pub fn available_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default()
}

/// FTDI VCP link to the board.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            port: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| TransportError::Open {
                port: self.port_name.clone(),
                reason: e.description,
            })?;
        info!("opened {} at {} baud", self.port_name, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("closed {}", self.port_name);
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        if max_bytes == 0 {
            return Ok(Vec::new());
        }
        port.set_timeout(timeout)?;
        let mut buf = vec![0u8; max_bytes];
        match port.read(&mut buf) {
            Ok(0) => Err(TransportError::ConnectionLost(format!(
                "{} returned end of stream",
                self.port_name
            ))),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }
}

enum Scripted {
    Bytes(Vec<u8>),
    Fail(String),
}

/// In-memory transport for tests and playback.
///
/// Reads hand out queued chunks in order (split to `max_bytes`); an
/// exhausted script sleeps for the timeout and reads nothing. Writes are
/// recorded and can be inspected through a [`ManualHandle`] even after the
/// transport has been moved into a worker.
pub struct ManualTransport {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    write_failure: Arc<Mutex<Option<String>>>,
    connected: bool,
    fail_open: bool,
}

/// Shared view of a [`ManualTransport`]'s script and write log.
#[derive(Clone)]
pub struct ManualHandle {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    write_failure: Arc<Mutex<Option<String>>>,
}

impl Default for ManualTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTransport {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            written: Arc::new(Mutex::new(Vec::new())),
            write_failure: Arc::new(Mutex::new(None)),
            connected: false,
            fail_open: false,
        }
    }

    pub fn with_chunks(chunks: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let transport = Self::new();
        transport.handle().push_chunks(chunks);
        transport
    }

    /// Makes every `open` fail, as if the device were unplugged.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn handle(&self) -> ManualHandle {
        ManualHandle {
            script: Arc::clone(&self.script),
            written: Arc::clone(&self.written),
            write_failure: Arc::clone(&self.write_failure),
        }
    }
}

impl ManualHandle {
    pub fn push_chunk(&self, chunk: Vec<u8>) {
        self.script.lock().push_back(Scripted::Bytes(chunk));
    }

    pub fn push_chunks(&self, chunks: impl IntoIterator<Item = Vec<u8>>) {
        let mut script = self.script.lock();
        script.extend(chunks.into_iter().map(Scripted::Bytes));
    }

    /// Queues a read failure after the chunks already queued.
    pub fn push_failure(&self, reason: impl Into<String>) {
        self.script.lock().push_back(Scripted::Fail(reason.into()));
    }

    pub fn pending(&self) -> usize {
        self.script.lock().len()
    }

    /// Every `write` so far, one entry per call.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub fn clear_written(&self) {
        self.written.lock().clear();
    }

    /// Makes every later `write` fail until [`Self::restore_writes`].
    pub fn fail_writes(&self, reason: impl Into<String>) {
        *self.write_failure.lock() = Some(reason.into());
    }

    pub fn restore_writes(&self) {
        *self.write_failure.lock() = None;
    }
}

impl Transport for ManualTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.fail_open {
            return Err(TransportError::Open {
                port: "manual".into(),
                reason: "device unavailable".into(),
            });
        }
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let next = self.script.lock().pop_front();
        match next {
            None => {
                thread::sleep(timeout);
                Ok(Vec::new())
            }
            Some(Scripted::Fail(reason)) => {
                debug!("manual transport failing read: {reason}");
                Err(TransportError::ConnectionLost(reason))
            }
            Some(Scripted::Bytes(mut chunk)) => {
                if chunk.len() > max_bytes {
                    let rest = chunk.split_off(max_bytes);
                    self.script.lock().push_front(Scripted::Bytes(rest));
                }
                Ok(chunk)
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(reason) = self.write_failure.lock().clone() {
            return Err(TransportError::ConnectionLost(reason));
        }
        self.written.lock().push(bytes.to_vec());
        Ok(())
    }
}
