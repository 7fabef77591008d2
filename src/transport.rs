//! # Serial transport
//!
//! Owns the physical port. A dedicated reader thread polls the port and forwards received chunks
//! in order, so [Transport::poll] never blocks the protocol logic. Writes are a single OS-level call
//! each and may be partial.
//!
//! All higher layers only depend on the [Transport] trait, so a different link (or a test double)
//! can be substituted.
use embedded_hal::delay::DelayNs;
use log::{debug, error};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Standard baud rates, tried in this order during liveness fallback
pub const BAUD_RATES: [u32; 6] = [9_600, 19_200, 38_400, 57_600, 115_200, 230_400];

/// Baud rate of the first connection attempt
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Max. bytes fetched from the port by one read call of the reader thread
const READ_CHUNK_SIZE: usize = 512;

/// Byte link to the modem
pub trait Transport {
    /// Writes as many bytes as the link accepts right now and returns the written count.
    /// Zero is a valid result if the link is temporarily unable to take data.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Returns all bytes received since the last call. Never blocks.
    fn poll(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Current baud rate
    fn baud_rate(&self) -> u32;

    /// Re-opens the link using the given baud rate
    fn reopen(&mut self, baud_rate: u32) -> Result<(), TransportError>;
}

/// Errors of the physical link
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// Port could not be opened
    Open { port: String, message: String },

    /// OS-level write failure
    Write(String),

    /// OS-level read failure, reported by the reader thread
    Read(String),

    /// Port is not open
    Closed,

    /// Reader thread terminated unexpectedly
    Disconnected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { port, message } => write!(f, "unable to open serial port {port}: {message}"),
            Self::Write(message) => write!(f, "serial write failed: {message}"),
            Self::Read(message) => write!(f, "serial read failed: {message}"),
            Self::Closed => write!(f, "serial port is not open"),
            Self::Disconnected => write!(f, "serial reader stopped"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Physical serial parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub name: String,

    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,

    /// OS read timeout of a single read call in the reader thread
    pub read_timeout_ms: u64,

    /// Sleep of the reader thread while the port is idle
    pub poll_interval_ms: u64,
}

impl PortConfig {
    /// 8N1 at the default baud rate, polled every 50 ms
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            read_timeout_ms: 10,
            poll_interval_ms: 50,
        }
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }
}

/// [Transport] backed by a local serial port
pub struct SerialTransport {
    config: PortConfig,

    /// Write half, None if closed
    port: Option<Box<dyn SerialPort>>,

    /// Background reader owning the read half
    reader: Option<Reader>,
}

impl SerialTransport {
    /// Opens the port and starts the reader thread
    pub fn open(config: PortConfig) -> Result<Self, TransportError> {
        let mut transport = Self {
            config,
            port: None,
            reader: None,
        };

        transport.start()?;
        Ok(transport)
    }

    /// Stops the reader thread and closes the port. Further writes fail with [TransportError::Closed].
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.stop();
        }

        self.port = None;
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let open_error = |error: serialport::Error| TransportError::Open {
            port: self.config.name.clone(),
            message: error.to_string(),
        };

        let port = serialport::new(self.config.name.as_str(), self.config.baud_rate)
            .data_bits(self.config.data_bits)
            .flow_control(FlowControl::None)
            .parity(self.config.parity)
            .stop_bits(self.config.stop_bits)
            .timeout(Duration::from_millis(self.config.read_timeout_ms))
            .open()
            .map_err(open_error)?;
        let read_half = port.try_clone().map_err(open_error)?;

        let reader = Reader::spawn(read_half, Duration::from_millis(self.config.poll_interval_ms)).map_err(|error| {
            TransportError::Open {
                port: self.config.name.clone(),
                message: error.to_string(),
            }
        })?;

        debug!("Opened {} at {} baud", self.config.name, self.config.baud_rate);
        self.port = Some(port);
        self.reader = Some(reader);
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;

        match port.write(data) {
            Ok(written) => {
                port.flush().map_err(|error| TransportError::Write(error.to_string()))?;
                Ok(written)
            }
            Err(error) if is_transient(&error) => Ok(0),
            Err(error) => Err(TransportError::Write(error.to_string())),
        }
    }

    fn poll(&mut self) -> Result<Vec<u8>, TransportError> {
        let reader = self.reader.as_ref().ok_or(TransportError::Closed)?;
        let mut data = Vec::new();

        loop {
            match reader.receiver.try_recv() {
                Ok(Ok(chunk)) => data.extend_from_slice(&chunk),
                Ok(Err(error)) => return Err(error),
                Err(TryRecvError::Empty) => return Ok(data),
                Err(TryRecvError::Disconnected) => {
                    if data.is_empty() {
                        return Err(TransportError::Disconnected);
                    }

                    return Ok(data);
                }
            }
        }
    }

    fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    fn reopen(&mut self, baud_rate: u32) -> Result<(), TransportError> {
        debug!("Re-opening {} at {} baud", self.config.name, baud_rate);
        self.close();
        self.config.baud_rate = baud_rate;
        self.start()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader thread forwarding received chunks through a channel
struct Reader {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    receiver: Receiver<Result<Vec<u8>, TransportError>>,
}

impl Reader {
    fn spawn(mut port: Box<dyn SerialPort>, interval: Duration) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (sender, receiver) = mpsc::channel();
        let flag = running.clone();

        let handle = thread::Builder::new().name("serial_read".to_string()).spawn(move || {
            let mut buffer = [0x0; READ_CHUNK_SIZE];

            while flag.load(Ordering::Acquire) {
                match port.read(&mut buffer) {
                    Ok(0) => {}
                    Ok(length) => {
                        if sender.send(Ok(buffer[..length].to_vec())).is_err() {
                            return;
                        }

                        // More data may be pending, read again without sleeping
                        continue;
                    }
                    Err(error) if is_transient(&error) => {}
                    Err(error) => {
                        error!("Serial reading thread error while reading: {}", error);
                        let _ = sender.send(Err(TransportError::Read(error.to_string())));
                        return;
                    }
                }

                thread::sleep(interval);
            }
        })?;

        Ok(Self {
            running,
            handle,
            receiver,
        })
    }

    fn stop(self) {
        self.running.store(false, Ordering::Release);
        if self.handle.join().is_err() {
            error!("Serial reading thread panicked");
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Splits a byte stream into trimmed text lines
#[derive(Default, Debug)]
pub struct LineBuffer {
    /// Bytes of the current, not yet terminated line
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the given bytes and returns all lines completed by them. Empty lines are skipped.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();

        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();

            if !text.is_empty() {
                lines.push(text);
            }
        }

        lines
    }

    /// Bytes received after the last line break
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Reason a bounded write loop gave up
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum WriteFailure {
    /// Link accepted zero bytes more often than allowed
    Stalled { written: usize },

    /// Link reported an error
    Transport { written: usize, error: TransportError },
}

/// Writes all of `data`, retrying the remaining bytes after short writes.
///
/// Only zero-byte writes count against `max_retries`; any progress resets the counter.
pub(crate) fn write_fully<P: Transport + ?Sized, D: DelayNs>(
    transport: &mut P,
    delay: &mut D,
    data: &[u8],
    max_retries: usize,
    retry_delay_ms: u32,
) -> Result<(), WriteFailure> {
    let mut offset = 0;
    let mut retries = 0;

    while offset < data.len() {
        match transport.write(&data[offset..]) {
            Ok(0) => {
                retries += 1;
                if retries > max_retries {
                    return Err(WriteFailure::Stalled { written: offset });
                }

                delay.delay_ms(retry_delay_ms);
            }
            Ok(written) => {
                offset += written.min(data.len() - offset);
                retries = 0;
            }
            Err(error) => return Err(WriteFailure::Transport { written: offset, error }),
        }
    }

    Ok(())
}
