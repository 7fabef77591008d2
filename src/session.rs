//! # Command session
//!
//! Runs one AT command at a time: writes the command, accumulates the response and matches it
//! against the expected success and failure tokens. Each attempt has its own timeout, timed out
//! attempts are retried a bounded number of times with a fresh write and an empty buffer.
//!
//! The session owns the transport, so holding `&mut CommandSession` is the exclusive right to put
//! bytes on the wire.
use crate::commands::CommandRequest;
use crate::responses::{CommandResult, Outcome, ResponseBuffer};
use crate::transport::{write_fully, LineBuffer, Transport, TransportError, WriteFailure};
use core::fmt;
use embedded_hal::delay::DelayNs;
use fugit::TimerDurationU32;
use fugit_timer::Timer;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default interval between two polls of the transport while waiting
pub const DEFAULT_POLL_INTERVAL_MS: u32 = 50;

/// Max. zero-byte writes while writing a command
const COMMAND_WRITE_RETRIES: usize = 5;

/// Delay after a zero-byte write of a command
const COMMAND_WRITE_RETRY_DELAY_MS: u32 = 5;

/// Max. polls for draining stale input before an attempt
const MAX_DRAIN_POLLS: usize = 8;

/// Errors aborting a command independent of the modem response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandError {
    /// Failure of the underlying link
    Transport(TransportError),

    /// Upstream timer error
    TimerError,

    /// Wait was aborted by the cancel token
    Cancelled,

    /// Link did not accept the command bytes
    WriteTimeout,

    /// AT commands are not interpreted while the link is in transparent mode. Reset the link first.
    TransparentMode,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(error) => write!(f, "{error}"),
            Self::TimerError => write!(f, "timer error"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::WriteTimeout => write!(f, "serial link did not accept the command"),
            Self::TransparentMode => write!(f, "link is in transparent mode"),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<TransportError> for CommandError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

/// Cooperative cancellation of blocking waits, may be triggered from any thread.
///
/// Once cancelled, every wait fails until [CancelToken::reset] is called.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

/// Correlates AT commands with their responses
pub struct CommandSession<P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> {
    /// Link to the modem
    pub(crate) transport: P,

    /// Timer used for timeout measurement
    pub(crate) timer: T,

    /// Used for poll intervals, settle times and retry back-off
    pub(crate) delay: D,

    /// Response of the command in flight
    buffer: ResponseBuffer,

    /// Splits received data for logging
    lines: LineBuffer,

    pub(crate) poll_interval_ms: u32,

    pub(crate) cancel_token: Option<CancelToken>,
}

impl<P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> CommandSession<P, T, D, TIMER_HZ> {
    pub fn new(transport: P, timer: T, delay: D) -> Self {
        Self {
            transport,
            timer,
            delay,
            buffer: ResponseBuffer::new(),
            lines: LineBuffer::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            cancel_token: None,
        }
    }

    /// Executes the command and blocks until a token was matched or all attempts timed out.
    ///
    /// Rejections and timeouts are regular outcomes of the returned [CommandResult]. Errors are
    /// returned only for transport, timer or cancellation failures.
    pub fn execute(&mut self, request: &CommandRequest) -> Result<CommandResult, CommandError> {
        if let Some(settle_ms) = request.settle_ms() {
            return self.settle(request, settle_ms);
        }

        let mut attempts = 0;

        loop {
            attempts += 1;
            self.begin_attempt(request)?;
            let retries_left = attempts <= request.max_retries();

            match self.await_outcome(request)? {
                Some(Outcome::Rejected(token)) if request.retries_rejections() && retries_left => {
                    debug!("{} answered {}, retrying", request, token);
                }
                Some(outcome) => {
                    debug!("{} => {:?} (attempt {})", request, outcome, attempts);
                    return Ok(CommandResult::new(outcome, self.buffer.take(), attempts));
                }
                None if !retries_left => {
                    warn!("{} timed out after {} attempt(s)", request, attempts);
                    return Ok(CommandResult::new(Outcome::TimedOut, self.buffer.take(), attempts));
                }
                None => debug!("{} timed out, retrying", request),
            }

            if request.retry_delay_ms() > 0 {
                self.pause(request.retry_delay_ms())?;
            }
        }
    }

    /// Writes a command which awaits no response and waits the settle time
    fn settle(&mut self, request: &CommandRequest, settle_ms: u32) -> Result<CommandResult, CommandError> {
        self.check_cancelled()?;
        self.buffer.reset(&[]);

        debug!(">> {}", request);
        self.write(request.command())?;
        self.pause(settle_ms)?;

        let data = self.poll_logged()?;
        self.buffer.extend(&data);
        Ok(CommandResult::new(Outcome::Settled, self.buffer.take(), 1))
    }

    /// Starts a fresh attempt: drops stale input, resets the buffer and writes the command
    fn begin_attempt(&mut self, request: &CommandRequest) -> Result<(), CommandError> {
        self.check_cancelled()?;
        self.discard_stale_input()?;
        self.buffer.reset(request.command());
        self.lines.clear();

        debug!(">> {}", request);
        self.write(request.command())
    }

    /// Accumulates input until a completing token matches (Some) or the attempt timed out (None).
    ///
    /// After an intermediate success token the attempt keeps reading. If it times out before the
    /// response completed, the intermediate token is the outcome.
    fn await_outcome(&mut self, request: &CommandRequest) -> Result<Option<Outcome>, CommandError> {
        self.timer
            .start(TimerDurationU32::millis(request.timeout_ms()))
            .map_err(|_| CommandError::TimerError)?;

        let mut intermediate = None;

        loop {
            self.check_cancelled()?;

            let data = self.poll_logged()?;
            if !data.is_empty() {
                self.buffer.extend(&data);
            }

            match self.buffer.scan(request.success_tokens(), request.failure_tokens()) {
                Some(Outcome::Matched(token)) if !request.is_final(token) => {
                    // Success tokens shadow failure tokens of the same scan
                    if let Some(rejection) = self.buffer.rejection(request.failure_tokens()) {
                        return Ok(Some(rejection));
                    }

                    if intermediate.is_none() {
                        debug!("{} => {}, awaiting completion", request, token);
                        intermediate = Some(Outcome::Matched(token));
                    }
                }
                Some(outcome) => return Ok(Some(outcome)),
                None => {}
            }

            match self.timer.wait() {
                Ok(_) => {
                    if let Some(outcome) = intermediate {
                        warn!("{} not completed, keeping {:?}", request, outcome);
                    }

                    return Ok(intermediate);
                }
                Err(nb::Error::WouldBlock) => self.delay.delay_ms(self.poll_interval_ms),
                Err(nb::Error::Other(_)) => return Err(CommandError::TimerError),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), CommandError> {
        write_fully(
            &mut self.transport,
            &mut self.delay,
            data,
            COMMAND_WRITE_RETRIES,
            COMMAND_WRITE_RETRY_DELAY_MS,
        )
        .map_err(|failure| match failure {
            WriteFailure::Stalled { .. } => CommandError::WriteTimeout,
            WriteFailure::Transport { error, .. } => CommandError::Transport(error),
        })
    }

    /// Drops data received outside of any command, e.g. late responses of a previous attempt
    fn discard_stale_input(&mut self) -> Result<(), CommandError> {
        for _ in 0..MAX_DRAIN_POLLS {
            let stale = self.transport.poll()?;
            if stale.is_empty() {
                break;
            }

            debug!("Discarding stale input: {:?}", String::from_utf8_lossy(&stale).trim());
        }

        self.lines.clear();
        Ok(())
    }

    /// Polls the transport and logs completed lines
    pub(crate) fn poll_logged(&mut self) -> Result<Vec<u8>, TransportError> {
        let data = self.transport.poll()?;

        for line in self.lines.push(&data) {
            debug!("<< {}", line);
        }

        Ok(data)
    }

    /// Sleeps the given time in poll interval slices, honoring the cancel token
    pub(crate) fn pause(&mut self, duration_ms: u32) -> Result<(), CommandError> {
        let step = if self.poll_interval_ms == 0 {
            duration_ms
        } else {
            self.poll_interval_ms
        };
        let mut remaining = duration_ms;

        while remaining > 0 {
            self.check_cancelled()?;

            let slice = remaining.min(step);
            self.delay.delay_ms(slice);
            remaining -= slice;
        }

        Ok(())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel_token.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    fn check_cancelled(&self) -> Result<(), CommandError> {
        if self.is_cancelled() {
            return Err(CommandError::Cancelled);
        }

        Ok(())
    }

    /// Sets the interval between two polls while waiting for data
    pub fn set_poll_interval_ms(&mut self, interval: u32) {
        self.poll_interval_ms = interval;
    }

    /// Installs a token which aborts any wait once cancelled
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel_token = Some(token);
    }

    pub fn transport(&self) -> &P {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut P {
        &mut self.transport
    }

    /// Returns transport, timer and delay
    pub fn release(self) -> (P, T, D) {
        (self.transport, self.timer, self.delay)
    }
}
