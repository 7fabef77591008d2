use crate::wifi::{Credentials, Endpoint};
use core::fmt;

/// Tokens treated as an explicit rejection unless a command overrides them
pub const FAILURE_TOKENS: &[&str] = &["ERROR", "FAIL"];

/// Escape sequence leaving the transparent mode. Must not be followed by CRLF.
const ESCAPE_SEQUENCE: &[u8] = b"+++";

/// Guard time after the escape sequence
const ESCAPE_SETTLE_MS: u32 = 1_000;

/// One outbound AT transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRequest {
    /// Raw bytes written to the link, including the line terminator
    command: Vec<u8>,

    /// Any of these tokens completes the command successfully
    success: &'static [&'static str],

    /// Any of these tokens completes the command as rejected
    failure: &'static [&'static str],

    /// Timeout per attempt
    timeout_ms: u32,

    /// Additional attempts after the first one timed out
    max_retries: usize,

    /// Pause between two attempts
    retry_delay_ms: u32,

    /// If set, no response is awaited. The command succeeds after the given wait.
    settle_ms: Option<u32>,

    /// Success tokens completing the response. Other success tokens are intermediate, the attempt
    /// keeps reading until a completing token arrives. Empty if every success token completes.
    final_tokens: &'static [&'static str],

    /// Retry an attempt answered by a failure token, like a timed out one
    retry_rejected: bool,
}

impl CommandRequest {
    /// Creates a request expecting `OK` within one second, rejected by `ERROR`/`FAIL`, not retried
    pub fn new(command: impl Into<Vec<u8>>) -> Self {
        Self {
            command: command.into(),
            success: &["OK"],
            failure: FAILURE_TOKENS,
            timeout_ms: 1_000,
            max_retries: 0,
            retry_delay_ms: 0,
            settle_ms: None,
            final_tokens: &[],
            retry_rejected: false,
        }
    }

    /// Creates a request for `AT<body>\r\n`
    pub fn at(body: &str) -> Self {
        Self::new(format!("AT{body}\r\n"))
    }

    /// Creates a request which awaits no response but succeeds after the given settle time
    pub fn settle(command: impl Into<Vec<u8>>, settle_ms: u32) -> Self {
        Self {
            success: &[],
            failure: &[],
            settle_ms: Some(settle_ms),
            ..Self::new(command)
        }
    }

    pub fn expecting(mut self, tokens: &'static [&'static str]) -> Self {
        self.success = tokens;
        self
    }

    pub fn failing_on(mut self, tokens: &'static [&'static str]) -> Self {
        self.failure = tokens;
        self
    }

    /// Marks all success tokens except the given ones as intermediate
    pub fn completed_by(mut self, tokens: &'static [&'static str]) -> Self {
        self.final_tokens = tokens;
        self
    }

    /// Failure tokens consume an attempt instead of completing the command
    pub fn retrying_rejections(mut self) -> Self {
        self.retry_rejected = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u32) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn command(&self) -> &[u8] {
        &self.command
    }

    pub fn success_tokens(&self) -> &'static [&'static str] {
        self.success
    }

    pub fn failure_tokens(&self) -> &'static [&'static str] {
        self.failure
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn retry_delay_ms(&self) -> u32 {
        self.retry_delay_ms
    }

    pub fn settle_ms(&self) -> Option<u32> {
        self.settle_ms
    }

    pub fn final_tokens(&self) -> &'static [&'static str] {
        self.final_tokens
    }

    /// True if the given success token completes the response
    pub fn is_final(&self, token: &str) -> bool {
        self.final_tokens.is_empty() || self.final_tokens.iter().any(|final_token| *final_token == token)
    }

    pub fn retries_rejections(&self) -> bool {
        self.retry_rejected
    }
}

impl CommandRequest {
    /// Leaves the transparent mode, no response required
    pub fn escape() -> Self {
        Self::settle(ESCAPE_SEQUENCE, ESCAPE_SETTLE_MS)
    }

    /// Liveness test. `ERROR` right after leaving the transparent mode is common, so rejected
    /// attempts are retried as well.
    pub fn test() -> Self {
        Self::at("").with_retries(2).with_retry_delay_ms(500).retrying_rejections()
    }

    /// Restarts the module and waits for the boot banner
    pub fn restart() -> Self {
        Self::at("+RST")
            .expecting(&["ready"])
            .failing_on(&["ERROR"])
            .with_timeout_ms(5_000)
    }

    /// Switches to station (client) mode. `no change` is reported by older firmware if already set.
    pub fn station_mode() -> Self {
        Self::at("+CWMODE=1").expecting(&["OK", "no change"]).with_retries(1)
    }

    /// Queries the current access point association
    pub fn query_join() -> Self {
        Self::at("+CWJAP?")
            .expecting(&["+CWJAP:"])
            .failing_on(&["No AP", "ERROR"])
            .with_timeout_ms(2_000)
            .with_retries(1)
    }

    /// Joins the given access point. Association and DHCP may take several seconds.
    ///
    /// `WIFI CONNECTED` and `WIFI GOT IP` are followed by the final `OK`, which is awaited so it can't
    /// be mistaken as response of the next command.
    pub fn join(credentials: &Credentials) -> Self {
        let command = format!(
            "AT+CWJAP=\"{}\",\"{}\"\r\n",
            escape_argument(credentials.ssid()),
            escape_argument(credentials.password())
        );

        Self::new(command)
            .expecting(&["OK", "WIFI GOT IP", "WIFI CONNECTED"])
            .completed_by(&["OK"])
            .with_timeout_ms(20_000)
    }

    /// Queries the local station addresses
    pub fn query_address() -> Self {
        Self::at("+CIFSR").expecting(&["STAIP"]).with_timeout_ms(2_000).with_retries(1)
    }

    /// Opens the (single) TCP connection. `ALREADY CONNECT` is a success, the link is still up.
    pub fn tcp_connect(endpoint: &Endpoint) -> Self {
        Self::new(format!("AT+CIPSTART=\"TCP\",\"{}\",{}\r\n", endpoint.host(), endpoint.port()))
            .expecting(&["OK", "ALREADY CONNECT"])
            .with_timeout_ms(5_000)
            .with_retries(1)
    }

    /// Enables or disables the transparent transmission mode
    pub fn transparent_mode(enabled: bool) -> Self {
        Self::at(if enabled { "+CIPMODE=1" } else { "+CIPMODE=0" }).with_retries(1)
    }

    /// Starts sending in transparent mode, confirmed by the send prompt
    pub fn start_send() -> Self {
        Self::at("+CIPSEND").expecting(&[">"]).with_timeout_ms(2_000).with_retries(1)
    }
}

impl fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.command).trim_end())
    }
}

/// Escapes the characters ESP-AT treats as argument delimiters
fn escape_argument(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for character in value.chars() {
        if matches!(character, '"' | ',' | '\\') {
            escaped.push('\\');
        }
        escaped.push(character);
    }

    escaped
}
