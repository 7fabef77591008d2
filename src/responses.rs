use heapless::String;
use log::warn;
use std::borrow::Cow;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Final outcome of a command
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The given success token was received
    Matched(&'static str),

    /// The given failure token was received
    Rejected(&'static str),

    /// Neither token was received by any attempt
    TimedOut,

    /// Command without expected response, settle time elapsed
    Settled,
}

/// Result of a command, immutable once created
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    outcome: Outcome,

    /// Bytes captured by the last attempt
    response: Vec<u8>,

    /// Number of times the command was written
    attempts: usize,
}

impl CommandResult {
    pub(crate) fn new(outcome: Outcome, response: Vec<u8>, attempts: usize) -> Self {
        Self {
            outcome,
            response,
            attempts,
        }
    }

    /// True if a success token was matched or the settle time elapsed
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Matched(_) | Outcome::Settled)
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// The matched success or failure token
    pub fn token(&self) -> Option<&'static str> {
        match self.outcome {
            Outcome::Matched(token) | Outcome::Rejected(token) => Some(token),
            Outcome::TimedOut | Outcome::Settled => None,
        }
    }

    pub fn response(&self) -> &[u8] {
        &self.response
    }

    pub fn response_text(&self) -> Cow<'_, str> {
        std::string::String::from_utf8_lossy(&self.response)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn into_response(self) -> Vec<u8> {
        self.response
    }
}

/// Received bytes of the command in flight
///
/// Tokens are searched in the whole accumulated data, as a single read may split a token. Already
/// scanned bytes are skipped, except for the overlap a split token may need.
#[derive(Default, Debug)]
pub struct ResponseBuffer {
    data: Vec<u8>,

    /// Length of data already scanned for tokens
    scanned: usize,

    /// Expected command echo, excluded from token matching
    echo: Vec<u8>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all data for a new attempt of the given command
    pub fn reset(&mut self, command: &[u8]) {
        self.data.clear();
        self.scanned = 0;
        self.echo.clear();
        self.echo.extend_from_slice(trim_line_end(command));
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Moves the data out, leaving an empty buffer
    pub fn take(&mut self) -> Vec<u8> {
        self.scanned = 0;
        core::mem::take(&mut self.data)
    }

    /// Searches for the first success token, then for the first failure token.
    pub fn scan(&mut self, success: &'static [&'static str], failure: &'static [&'static str]) -> Option<Outcome> {
        let body_start = self.body_start()?;

        let longest = success.iter().chain(failure).map(|token| token.len()).max().unwrap_or(0);
        if longest == 0 {
            return None;
        }

        let from = self.scanned.saturating_sub(longest - 1).max(body_start);
        let window = &self.data[from..];
        self.scanned = self.data.len();

        if let Some(token) = success.iter().find(|token| contains(window, token.as_bytes())) {
            return Some(Outcome::Matched(*token));
        }

        failure
            .iter()
            .find(|token| contains(window, token.as_bytes()))
            .map(|token| Outcome::Rejected(*token))
    }

    /// Searches the whole response, excluding the echo, for a failure token
    pub fn rejection(&self, failure: &'static [&'static str]) -> Option<Outcome> {
        let body = &self.data[self.body_start()?..];

        failure
            .iter()
            .find(|token| contains(body, token.as_bytes()))
            .map(|token| Outcome::Rejected(*token))
    }

    /// Start of the actual response after an optional command echo.
    /// None while the received data is still a prefix of the echo.
    fn body_start(&self) -> Option<usize> {
        if self.echo.is_empty() {
            return Some(0);
        }

        if self.data.starts_with(&self.echo) {
            return Some(self.echo.len());
        }

        if self.echo.starts_with(&self.data) {
            return None;
        }

        Some(0)
    }
}

/// Returns the index of the first occurrence of needle
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }

    haystack.windows(needle.len()).position(|window| window == needle)
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

fn trim_line_end(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|byte| *byte != b'\r' && *byte != b'\n')
        .map_or(0, |index| index + 1);
    &data[..end]
}

/// Lines terminated by LF. A trailing incomplete line is skipped.
fn complete_lines(data: &[u8]) -> impl Iterator<Item = &str> {
    let end = data.iter().rposition(|byte| *byte == b'\n').map_or(0, |index| index + 1);

    data[..end]
        .split(|byte| *byte == b'\n')
        .filter_map(|line| core::str::from_utf8(line).ok())
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

/// Local IP and MAC addresses
#[derive(Default, Clone, Debug, PartialEq)]
pub struct LocalAddress {
    /// Local IPv4 address if assigned
    pub ipv4: Option<Ipv4Addr>,

    /// Local MAC address
    pub mac: Option<String<17>>,

    /// Link local IPv6 address if assigned
    pub ipv6_link_local: Option<Ipv6Addr>,

    /// Global IPv6 address if assigned
    pub ipv6_global: Option<Ipv6Addr>,
}

impl LocalAddress {
    /// Parses the `+CIFSR:<type>,"<address>"` lines of the address query.
    /// Malformed addresses are skipped, as the address is just used for diagnostics.
    pub(crate) fn from_response(response: &[u8]) -> Self {
        let mut data = Self::default();

        for line in complete_lines(response) {
            let Some((address_type, address)) = line.strip_prefix("+CIFSR:").and_then(|line| line.split_once(',')) else {
                continue;
            };
            let address = address.trim_matches('"');

            match address_type {
                "STAIP" => data.ipv4 = parse_address(address_type, address),
                "STAIP6LL" => data.ipv6_link_local = parse_address(address_type, address),
                "STAIP6GL" => data.ipv6_global = parse_address(address_type, address),
                "STAMAC" => {
                    let mut mac = String::new();
                    if mac.push_str(address).is_ok() {
                        data.mac = Some(mac);
                    }
                }
                _ => {}
            }
        }

        data
    }
}

fn parse_address<A: FromStr>(address_type: &str, address: &str) -> Option<A> {
    let parsed = A::from_str(address).ok();
    if parsed.is_none() {
        warn!("Ignoring malformed {} address '{}'", address_type, address);
    }

    parsed
}

/// Access point the modem is currently associated with
#[derive(Default, Clone, Debug, PartialEq)]
pub struct JoinedNetwork {
    /// SSID, None if the status line was not completely received
    pub ssid: Option<String<32>>,
}

impl JoinedNetwork {
    /// Parses the `+CWJAP:"<ssid>",...` status line
    pub(crate) fn from_response(response: &[u8]) -> Self {
        let ssid = complete_lines(response)
            .filter_map(|line| line.strip_prefix("+CWJAP:\""))
            .find_map(|rest| rest.split_once('"'))
            .and_then(|(ssid, _)| {
                let mut value = String::new();
                value.push_str(ssid).ok()?;
                Some(value)
            });

        Self { ssid }
    }
}
