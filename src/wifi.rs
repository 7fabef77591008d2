//! # WIFI bring-up
//!
//! [Adapter] takes the modem from an unknown state to a joined network, an open TCP connection or
//! the transparent send mode. The steps always run in the same order; a [BringupPlan] selects the
//! optional ones and how far to go. A failed step aborts the bring-up and is reported by name.
//!
//! ## Example
//!
//! ````
//! # use esp_at_link::example::{ExampleDelay, ExampleTimer, ExampleTransport};
//! use esp_at_link::wifi::{Adapter, Credentials, ModemState};
//!
//! let transport = ExampleTransport::default();
//! let mut adapter: Adapter<_, _, _, 1_000_000> = Adapter::new(transport, ExampleTimer::default(), ExampleDelay);
//!
//! let credentials = Credentials::new("test_wifi", "secret").unwrap();
//! let report = adapter.provision(&credentials).unwrap();
//!
//! assert_eq!(ModemState::Ready, report.state);
//! assert_eq!("10.0.0.181", report.address.unwrap().ipv4.unwrap().to_string());
//! ````
use crate::commands::CommandRequest;
use crate::responses::{CommandResult, JoinedNetwork, LocalAddress, Outcome};
use crate::session::{CancelToken, CommandError, CommandSession};
use crate::transport::{Transport, BAUD_RATES};
use crate::tunnel::{TransparentTunnel, TunnelConfig, TunnelError};
use core::fmt;
use embedded_hal::delay::DelayNs;
use fugit_timer::Timer;
use heapless::String;
use log::{info, warn};

/// Boot time of the module after a restart
const RESTART_SETTLE_MS: u32 = 5_000;

/// Progress of the bring-up
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModemState {
    /// No bring-up ran yet, or the link was reset to command mode
    Idle,
    /// Leaving transparent mode, liveness test and restart
    Testing,
    /// Setting station mode
    SettingMode,
    /// Join status, join and address query
    Joining,
    /// TCP connect and entering transparent mode
    Connecting,
    /// Plan completed in command mode, e.g. after provisioning
    Ready,
    /// Passthrough active, AT commands are no longer interpreted
    Transparent,
    /// A step failed
    Failed,
}

/// Named bring-up steps
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    ExitTransparent,
    Liveness,
    Restart,
    SetStationMode,
    QueryJoinStatus,
    Join,
    QueryAddress,
    TcpConnect,
    EnterTransparentSend,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ExitTransparent => "exit transparent mode",
            Self::Liveness => "AT liveness test",
            Self::Restart => "module restart",
            Self::SetStationMode => "station mode setup",
            Self::QueryJoinStatus => "join status query",
            Self::Join => "Wi-Fi join",
            Self::QueryAddress => "IP address query",
            Self::TcpConnect => "TCP connect",
            Self::EnterTransparentSend => "transparent send mode",
        };

        f.write_str(name)
    }
}

/// Why a step did not succeed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepFailure {
    /// No token received within the timeout of all attempts
    Timeout { attempts: usize },

    /// Modem answered with the given failure token
    Rejected(&'static str),
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { attempts } => write!(f, "no response after {attempts} attempt(s)"),
            Self::Rejected(token) => write!(f, "modem answered {token}"),
        }
    }
}

/// Possible errors of the bring-up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BringupError {
    /// The step was answered negatively or not at all
    StepFailed { step: Step, failure: StepFailure },

    /// Link, timer or cancellation failure while running the step
    Command { step: Step, error: CommandError },

    /// Given SSID is longer then the max. size of 32 chars
    InvalidSsidLength,

    /// Given password is longer then the max. size of 63 chars
    InvalidPasswordLength,
}

impl BringupError {
    /// The failed step, None for invalid credentials
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::StepFailed { step, .. } | Self::Command { step, .. } => Some(*step),
            Self::InvalidSsidLength | Self::InvalidPasswordLength => None,
        }
    }
}

impl fmt::Display for BringupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepFailed { step, failure } => write!(f, "{step} failed: {failure}"),
            Self::Command { step, error } => write!(f, "{step} failed: {error}"),
            Self::InvalidSsidLength => write!(f, "SSID is longer than 32 characters"),
            Self::InvalidPasswordLength => write!(f, "password is longer than 63 characters"),
        }
    }
}

impl std::error::Error for BringupError {}

/// WIFI credentials, length-checked on construction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    ssid: String<32>,
    password: String<64>,
}

impl Credentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, BringupError> {
        if password.len() > 63 {
            return Err(BringupError::InvalidPasswordLength);
        }

        let mut credentials = Self {
            ssid: String::new(),
            password: String::new(),
        };
        credentials.ssid.push_str(ssid).map_err(|_| BringupError::InvalidSsidLength)?;
        credentials
            .password
            .push_str(password)
            .map_err(|_| BringupError::InvalidPasswordLength)?;

        Ok(credentials)
    }

    pub fn ssid(&self) -> &str {
        self.ssid.as_str()
    }

    pub fn password(&self) -> &str {
        self.password.as_str()
    }
}

/// Remote TCP server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: std::string::String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<std::string::String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Final step of a bring-up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Stop after join (and the optional address query)
    Joined,

    /// Additionally open a TCP connection
    Connected(Endpoint),

    /// Additionally open a TCP connection and enter the transparent send mode
    Transparent(Endpoint),
}

/// Selects the steps of a bring-up
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BringupPlan {
    /// Send the escape sequence first. Always done if the adapter knows the link is transparent.
    pub exit_transparent: bool,

    /// Restart the module after the liveness test
    pub restart: bool,

    /// Skip joining if the modem is already associated
    pub query_join: bool,

    /// Query the assigned station address, failure is just a warning
    pub query_address: bool,

    pub target: Target,
}

impl BringupPlan {
    /// Joins the network from any state, for provisioning a device
    pub fn provisioning() -> Self {
        Self {
            exit_transparent: true,
            restart: true,
            query_join: true,
            query_address: true,
            target: Target::Joined,
        }
    }

    /// Full chain up to the transparent send mode
    pub fn upload(endpoint: Endpoint) -> Self {
        Self {
            exit_transparent: true,
            restart: false,
            query_join: true,
            query_address: false,
            target: Target::Transparent(endpoint),
        }
    }
}

/// Summary of a successful bring-up
#[derive(Clone, Debug, PartialEq)]
pub struct BringupReport {
    /// State the adapter ended in
    pub state: ModemState,

    /// Baud rate the modem answered at
    pub baud_rate: u32,

    /// Set if the join was skipped because the modem was already associated
    pub joined_network: Option<JoinedNetwork>,

    /// Result of the address query, if queried and answered
    pub address: Option<LocalAddress>,
}

/// Central client for the modem
pub struct Adapter<P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> {
    /// Command/response correlation, owns the link
    pub(crate) session: CommandSession<P, T, D, TIMER_HZ>,

    /// Current bring-up state
    state: ModemState,

    /// True once a TCP connect succeeded during the current bring-up
    tcp_connected: bool,

    /// True once the current bring-up joined (or found) a network
    joined: bool,

    /// Parameters for transparent transmission
    pub(crate) tunnel_config: TunnelConfig,
}

impl<P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> Adapter<P, T, D, TIMER_HZ> {
    /// Creates a new adapter. The link state is unknown, so the first bring-up should leave the transparent mode.
    pub fn new(transport: P, timer: T, delay: D) -> Self {
        Self {
            session: CommandSession::new(transport, timer, delay),
            state: ModemState::Idle,
            tcp_connected: false,
            joined: false,
            tunnel_config: TunnelConfig::default(),
        }
    }

    /// Runs the steps selected by the plan.
    ///
    /// Any failed step sets the state to [ModemState::Failed] and aborts the remaining steps.
    pub fn bring_up(&mut self, credentials: &Credentials, plan: &BringupPlan) -> Result<BringupReport, BringupError> {
        let result = self.run_plan(credentials, plan);

        if let Err(error) = &result {
            warn!("Bring-up failed: {}", error);
            self.state = ModemState::Failed;
        }

        result
    }

    /// Joins the network, restarting the module first. Stops in command mode.
    pub fn provision(&mut self, credentials: &Credentials) -> Result<BringupReport, BringupError> {
        self.bring_up(credentials, &BringupPlan::provisioning())
    }

    /// Executes a single command. Refused while the link is in transparent mode.
    pub fn execute(&mut self, request: &CommandRequest) -> Result<CommandResult, CommandError> {
        if self.state == ModemState::Transparent {
            return Err(CommandError::TransparentMode);
        }

        self.session.execute(request)
    }

    /// Leaves the transparent mode and disables it, so the link accepts AT commands again
    pub fn reset_link(&mut self) -> Result<(), CommandError> {
        self.session.execute(&CommandRequest::escape())?;

        let result = self.session.execute(&CommandRequest::transparent_mode(false))?;
        if !result.is_success() {
            warn!("Disabling transparent mode not confirmed: {:?}", result.outcome());
        }

        self.state = ModemState::Idle;
        self.tcp_connected = false;
        Ok(())
    }

    /// Returns the transparent tunnel. Just available after a bring-up reached [ModemState::Transparent].
    pub fn tunnel(&mut self) -> Result<TransparentTunnel<'_, P, T, D, TIMER_HZ>, TunnelError> {
        let config = self.tunnel_config;
        self.tunnel_with(config)
    }

    /// Same as [Adapter::tunnel] with custom parameters
    pub fn tunnel_with(&mut self, config: TunnelConfig) -> Result<TransparentTunnel<'_, P, T, D, TIMER_HZ>, TunnelError> {
        if self.state != ModemState::Transparent {
            return Err(TunnelError::NotTransparent);
        }

        Ok(TransparentTunnel::new(&mut self.session, config))
    }

    pub fn get_state(&self) -> ModemState {
        self.state
    }

    /// True if the last bring-up joined or found a network
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Sets the interval between two polls while waiting for data
    pub fn set_poll_interval_ms(&mut self, interval: u32) {
        self.session.set_poll_interval_ms(interval);
    }

    /// Installs a token which aborts any running wait once cancelled
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.session.set_cancel_token(token);
    }

    pub fn set_tunnel_config(&mut self, config: TunnelConfig) {
        self.tunnel_config = config;
    }

    pub fn transport(&self) -> &P {
        self.session.transport()
    }

    /// Returns transport, timer and delay
    pub fn release(self) -> (P, T, D) {
        self.session.release()
    }

    fn run_plan(&mut self, credentials: &Credentials, plan: &BringupPlan) -> Result<BringupReport, BringupError> {
        let escape = plan.exit_transparent || self.state == ModemState::Transparent;

        self.state = ModemState::Testing;
        self.tcp_connected = false;
        self.joined = false;

        if escape {
            self.run(Step::ExitTransparent, &CommandRequest::escape())?;
        }

        let baud_rate = self.check_liveness()?;

        if plan.restart {
            self.restart()?;
        }

        self.state = ModemState::SettingMode;
        self.run(Step::SetStationMode, &CommandRequest::station_mode())?;

        self.state = ModemState::Joining;
        let joined_network = if plan.query_join { self.query_join()? } else { None };

        if let Some(network) = &joined_network {
            info!("Already joined to {:?}, skipping join", network.ssid);
        } else {
            self.run(Step::Join, &CommandRequest::join(credentials))?;
            info!("Joined {}", credentials.ssid());
        }
        self.joined = true;

        let address = if plan.query_address { self.query_address()? } else { None };

        match &plan.target {
            Target::Joined => self.state = ModemState::Ready,
            Target::Connected(endpoint) => {
                self.connect(endpoint)?;
                self.state = ModemState::Ready;
            }
            Target::Transparent(endpoint) => {
                self.connect(endpoint)?;
                self.enter_transparent()?;
            }
        }

        Ok(BringupReport {
            state: self.state,
            baud_rate,
            joined_network,
            address,
        })
    }

    /// Executes the command of a step, any outcome except success fails the step
    fn run(&mut self, step: Step, request: &CommandRequest) -> Result<CommandResult, BringupError> {
        let result = self.execute_step(step, request)?;

        match result.outcome() {
            Outcome::Matched(_) | Outcome::Settled => Ok(result),
            Outcome::Rejected(token) => Err(BringupError::StepFailed {
                step,
                failure: StepFailure::Rejected(token),
            }),
            Outcome::TimedOut => Err(BringupError::StepFailed {
                step,
                failure: StepFailure::Timeout {
                    attempts: result.attempts(),
                },
            }),
        }
    }

    /// Executes the command of a step, just link failures are errors
    fn execute_step(&mut self, step: Step, request: &CommandRequest) -> Result<CommandResult, BringupError> {
        self.session
            .execute(request)
            .map_err(|error| BringupError::Command { step, error })
    }

    /// Tests the link at the current baud rate, then at all other standard rates. Returns the working rate.
    fn check_liveness(&mut self) -> Result<u32, BringupError> {
        let current = self.session.transport.baud_rate();

        let mut failure = match self.run(Step::Liveness, &CommandRequest::test()) {
            Ok(_) => return Ok(current),
            Err(BringupError::StepFailed { failure, .. }) => failure,
            Err(error) => return Err(error),
        };

        warn!("No response at {} baud, trying other baud rates", current);

        for baud_rate in BAUD_RATES.iter().copied().filter(|rate| *rate != current) {
            if let Err(error) = self.session.transport.reopen(baud_rate) {
                warn!("Unable to re-open link at {} baud: {}", baud_rate, error);
                continue;
            }

            match self.run(Step::Liveness, &CommandRequest::test().with_retries(1)) {
                Ok(_) => {
                    info!("Modem responding at {} baud", baud_rate);
                    return Ok(baud_rate);
                }
                Err(BringupError::StepFailed { failure: last, .. }) => failure = last,
                Err(error) => return Err(error),
            }
        }

        if let Err(error) = self.session.transport.reopen(current) {
            warn!("Unable to restore baud rate {}: {}", current, error);
        }

        Err(BringupError::StepFailed {
            step: Step::Liveness,
            failure,
        })
    }

    /// Restarts the module. A missing `ready` is just a warning.
    fn restart(&mut self) -> Result<(), BringupError> {
        let result = self.execute_step(Step::Restart, &CommandRequest::restart())?;
        if !result.is_success() {
            warn!("Module restart not confirmed ({:?}), continuing", result.outcome());
        }

        self.session
            .pause(RESTART_SETTLE_MS)
            .map_err(|error| BringupError::Command {
                step: Step::Restart,
                error,
            })
    }

    /// Returns the associated network, None if not joined
    fn query_join(&mut self) -> Result<Option<JoinedNetwork>, BringupError> {
        let result = self.execute_step(Step::QueryJoinStatus, &CommandRequest::query_join())?;

        if !result.is_success() {
            return Ok(None);
        }

        Ok(Some(JoinedNetwork::from_response(result.response())))
    }

    /// Returns the local address. A failed query is just a warning.
    fn query_address(&mut self) -> Result<Option<LocalAddress>, BringupError> {
        let result = self.execute_step(Step::QueryAddress, &CommandRequest::query_address())?;

        if !result.is_success() {
            warn!("Unable to obtain station IP ({:?})", result.outcome());
            return Ok(None);
        }

        Ok(Some(LocalAddress::from_response(result.response())))
    }

    fn connect(&mut self, endpoint: &Endpoint) -> Result<(), BringupError> {
        self.state = ModemState::Connecting;

        let result = self.run(Step::TcpConnect, &CommandRequest::tcp_connect(endpoint))?;
        if result.token() == Some("ALREADY CONNECT") {
            info!("Connection to {}:{} was already open", endpoint.host(), endpoint.port());
        }

        self.tcp_connected = true;
        Ok(())
    }

    /// Enables the transparent mode and starts sending. Requires a connected socket.
    fn enter_transparent(&mut self) -> Result<(), BringupError> {
        debug_assert!(self.tcp_connected);

        self.run(Step::EnterTransparentSend, &CommandRequest::transparent_mode(true))?;
        self.run(Step::EnterTransparentSend, &CommandRequest::start_send())?;

        info!("Transparent send mode active");
        self.state = ModemState::Transparent;
        Ok(())
    }
}
