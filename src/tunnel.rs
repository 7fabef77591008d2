//! # Transparent tunnel
//!
//! Once the bring-up reached the transparent send mode, every byte written to the link is forwarded
//! as TCP payload and every received byte is TCP payload from the remote side. [TransparentTunnel]
//! exclusively borrows the adapter, so no AT command can interleave with tunnel traffic.
//!
//! Payloads are sent in chunks sized for the internal buffer of the modem. Responses are
//! accumulated until a completion predicate matches, e.g. [reply_complete] for HTTP replies.
//!
//! ## Example
//!
//! ````
//! # use esp_at_link::example::{ExampleDelay, ExampleTimer, ExampleTransport};
//! use esp_at_link::tunnel::{extract_json, reply_complete};
//! use esp_at_link::wifi::{Adapter, BringupPlan, Credentials, Endpoint};
//!
//! let mut adapter: Adapter<_, _, _, 1_000_000> =
//!     Adapter::new(ExampleTransport::default(), ExampleTimer::default(), ExampleDelay);
//! let credentials = Credentials::new("test_wifi", "secret").unwrap();
//! adapter.bring_up(&credentials, &BringupPlan::upload(Endpoint::new("10.0.0.1", 8080))).unwrap();
//!
//! let mut tunnel = adapter.tunnel().unwrap();
//! tunnel.send(b"GET /status HTTP/1.1\r\nHost: 10.0.0.1\r\n\r\n").unwrap();
//!
//! let reply = tunnel.await_response(reply_complete, 1_000).unwrap();
//! assert_eq!(b"{\"results\":[]}", extract_json(&reply).unwrap());
//! ````
use crate::responses::{contains, find};
use crate::session::{CommandError, CommandSession};
use crate::transport::{write_fully, Transport, TransportError, WriteFailure};
use core::fmt;
use embedded_hal::delay::DelayNs;
use embedded_io::{ErrorKind, ErrorType, Read, Write};
use fugit::TimerDurationU32;
use fugit_timer::Timer;
use log::{debug, warn};

/// End of HTTP headers
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parameters of the transparent transmission
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Max. bytes written at once. Should not exceed the internal buffer of the modem.
    pub chunk_size: usize,

    /// Max. consecutive zero-byte writes per chunk
    pub write_retries: usize,

    /// Pause after a zero-byte write
    pub retry_delay_ms: u32,

    /// Pause between two chunks
    pub chunk_delay_ms: u32,

    /// Max. wait for a response, also used by [Read]
    pub response_timeout_ms: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            write_retries: 5,
            retry_delay_ms: 20,
            chunk_delay_ms: 20,
            response_timeout_ms: 10_000,
        }
    }
}

/// Errors of the tunnel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelError {
    /// Tunnel requested while the link is not in transparent mode
    NotTransparent,

    /// Link accepted no data within the retry budget. `sent` bytes were delivered before.
    WriteTimeout { sent: usize },

    /// Link reported a write error. `sent` bytes were delivered before.
    WriteError { sent: usize, error: TransportError },

    /// Failure while receiving
    Transport(TransportError),

    /// Upstream timer error
    TimerError,

    /// Wait was aborted by the cancel token
    Cancelled,

    /// No data received within the response timeout
    ReadTimeout,

    /// Response contains no `{...}` span
    PayloadParse,
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotTransparent => write!(f, "link is not in transparent mode"),
            Self::WriteTimeout { sent } => write!(f, "chunk write timed out after {sent} bytes"),
            Self::WriteError { sent, error } => write!(f, "chunk write failed after {sent} bytes: {error}"),
            Self::Transport(error) => write!(f, "{error}"),
            Self::TimerError => write!(f, "timer error"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ReadTimeout => write!(f, "no data received"),
            Self::PayloadParse => write!(f, "no JSON object in response"),
        }
    }
}

impl std::error::Error for TunnelError {}

impl embedded_io::Error for TunnelError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotTransparent => ErrorKind::NotConnected,
            Self::WriteTimeout { .. } | Self::ReadTimeout => ErrorKind::TimedOut,
            Self::Cancelled => ErrorKind::Interrupted,
            Self::PayloadParse => ErrorKind::InvalidData,
            Self::WriteError { .. } | Self::Transport(_) | Self::TimerError => ErrorKind::Other,
        }
    }
}

impl From<TransportError> for TunnelError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

impl From<CommandError> for TunnelError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::Transport(error) => Self::Transport(error),
            CommandError::Cancelled => Self::Cancelled,
            CommandError::TimerError => Self::TimerError,
            CommandError::WriteTimeout => Self::WriteTimeout { sent: 0 },
            CommandError::TransparentMode => Self::NotTransparent,
        }
    }
}

/// Raw duplex stream over the link in transparent mode
pub struct TransparentTunnel<'a, P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> {
    session: &'a mut CommandSession<P, T, D, TIMER_HZ>,

    config: TunnelConfig,

    /// Received bytes not consumed yet
    pending: Vec<u8>,

    /// Total bytes sent through this tunnel
    sent: usize,
}

impl<'a, P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> TransparentTunnel<'a, P, T, D, TIMER_HZ> {
    pub(crate) fn new(session: &'a mut CommandSession<P, T, D, TIMER_HZ>, config: TunnelConfig) -> Self {
        Self {
            session,
            config,
            pending: Vec::new(),
            sent: 0,
        }
    }

    /// Sends the whole payload in chunks of the configured size.
    ///
    /// Short writes are continued with the remaining bytes of the chunk. On success exactly
    /// `payload.len()` bytes were written, in order.
    pub fn send(&mut self, payload: &[u8]) -> Result<usize, TunnelError> {
        let mut sent = 0;

        for (index, chunk) in payload.chunks(self.config.chunk_size.max(1)).enumerate() {
            if index > 0 && self.config.chunk_delay_ms > 0 {
                self.session.pause(self.config.chunk_delay_ms)?;
            } else if self.session.is_cancelled() {
                return Err(TunnelError::Cancelled);
            }

            write_fully(
                &mut self.session.transport,
                &mut self.session.delay,
                chunk,
                self.config.write_retries,
                self.config.retry_delay_ms,
            )
            .map_err(|failure| match failure {
                WriteFailure::Stalled { written } => TunnelError::WriteTimeout { sent: sent + written },
                WriteFailure::Transport { written, error } => TunnelError::WriteError {
                    sent: sent + written,
                    error,
                },
            })?;

            sent += chunk.len();
            self.sent += chunk.len();
        }

        debug!("Sent {} bytes through tunnel", sent);
        Ok(sent)
    }

    /// Accumulates received bytes until `complete` returns true or the timeout elapsed.
    ///
    /// On timeout the partial capture is returned, so the caller may still use whatever arrived.
    pub fn await_response<F>(&mut self, complete: F, timeout_ms: u32) -> Result<Vec<u8>, TunnelError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let mut captured = core::mem::take(&mut self.pending);
        if !captured.is_empty() && complete(&captured) {
            return Ok(captured);
        }

        self.session
            .timer
            .start(TimerDurationU32::millis(timeout_ms))
            .map_err(|_| TunnelError::TimerError)?;

        loop {
            if self.session.is_cancelled() {
                return Err(TunnelError::Cancelled);
            }

            let data = self.session.poll_logged()?;
            if !data.is_empty() {
                captured.extend_from_slice(&data);

                if complete(&captured) {
                    return Ok(captured);
                }
            }

            match self.session.timer.wait() {
                Ok(_) => {
                    warn!("Response incomplete after {} ms, captured {} bytes", timeout_ms, captured.len());
                    return Ok(captured);
                }
                Err(nb::Error::WouldBlock) => {
                    let interval = self.session.poll_interval_ms;
                    self.session.delay.delay_ms(interval);
                }
                Err(nb::Error::Other(_)) => return Err(TunnelError::TimerError),
            }
        }
    }

    /// Total bytes sent through this tunnel
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Waits until at least one byte is pending
    fn fill_pending(&mut self) -> Result<(), TunnelError> {
        let timeout_ms = self.config.response_timeout_ms;
        let data = self.await_response(|data| !data.is_empty(), timeout_ms)?;

        if data.is_empty() {
            return Err(TunnelError::ReadTimeout);
        }

        self.pending = data;
        Ok(())
    }
}

impl<P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> ErrorType for TransparentTunnel<'_, P, T, D, TIMER_HZ> {
    type Error = TunnelError;
}

impl<P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> Write for TransparentTunnel<'_, P, T, D, TIMER_HZ> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.send(buf)
    }

    /// Every write is passed to the link immediately
    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> Read for TransparentTunnel<'_, P, T, D, TIMER_HZ> {
    /// Blocks until data is available, at most for the configured response timeout
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.pending.is_empty() {
            self.fill_pending()?;
        }

        let length = buf.len().min(self.pending.len());
        buf[..length].copy_from_slice(&self.pending[..length]);
        self.pending.drain(..length);
        Ok(length)
    }
}

/// Returns the span from the first `{` to the last `}`.
///
/// This is a plain heuristic: nesting, braces inside strings and completeness are not checked.
/// Good enough for a reply carrying a single JSON object after the HTTP headers.
pub fn extract_json(data: &[u8]) -> Result<&[u8], TunnelError> {
    let start = data.iter().position(|byte| *byte == b'{').ok_or(TunnelError::PayloadParse)?;
    let end = data.iter().rposition(|byte| *byte == b'}').ok_or(TunnelError::PayloadParse)?;

    if end < start {
        return Err(TunnelError::PayloadParse);
    }

    Ok(&data[start..=end])
}

/// True once a HTTP reply is completely received.
///
/// Requires the header terminator. With a `Content-Length` header the announced body size must
/// have arrived, otherwise the body must contain a `}`.
pub fn reply_complete(data: &[u8]) -> bool {
    let Some(header_end) = find(data, HEADER_TERMINATOR) else {
        return false;
    };
    let body = &data[header_end + HEADER_TERMINATOR.len()..];

    match content_length(&data[..header_end]) {
        Some(length) => body.len() >= length,
        None => contains(body, b"}"),
    }
}

/// Status code of the HTTP status line, None if the data does not start with one
pub fn http_status(data: &[u8]) -> Option<u16> {
    let line_end = find(data, b"\r\n").unwrap_or(data.len());
    let line = core::str::from_utf8(&data[..line_end]).ok()?;

    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }

    parts.next()?.parse().ok()
}

/// Value of the `Content-Length` header, matched case-insensitively
pub fn content_length(header: &[u8]) -> Option<usize> {
    header
        .split(|byte| *byte == b'\n')
        .filter_map(|line| core::str::from_utf8(line).ok())
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
}
