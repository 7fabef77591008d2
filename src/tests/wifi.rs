use crate::commands::CommandRequest;
use crate::session::{CancelToken, CommandError};
use crate::tests::mock::{MockTransport, RecordingDelay, TickTimer};
use crate::transport::Transport;
use crate::tunnel::TunnelError;
use crate::wifi::{Adapter, BringupError, BringupPlan, Credentials, Endpoint, ModemState, Step, StepFailure, Target};
use std::net::Ipv4Addr;

type AdapterType = Adapter<MockTransport, TickTimer, RecordingDelay, 1_000_000>;

const JOIN_COMMAND: &[u8] = b"AT+CWJAP=\"test_wifi\",\"secret\"\r\n";
const CONNECT_COMMAND: &[u8] = b"AT+CIPSTART=\"TCP\",\"10.0.0.1\",8080\r\n";

fn adapter(transport: MockTransport) -> AdapterType {
    Adapter::new(transport, TickTimer::default(), RecordingDelay::new())
}

fn credentials() -> Credentials {
    Credentials::new("test_wifi", "secret").unwrap()
}

fn endpoint() -> Endpoint {
    Endpoint::new("10.0.0.1", 8080)
}

/// Liveness, station mode, not joined yet, join
fn script_join(transport: &mut MockTransport) {
    transport.reply_ok(b"AT\r\n");
    transport.reply(b"AT+CWMODE=1\r\n", &[b"\r\nno change\r\n"]);
    transport.reply(b"AT+CWJAP?\r\n", &[b"No AP\r\n", b"\r\nOK\r\n"]);
    transport.reply(JOIN_COMMAND, &[b"WIFI CONNECTED\r\n", b"WIFI GOT IP\r\n\r\nOK\r\n"]);
}

fn script_transparent(transport: &mut MockTransport) {
    transport.reply(CONNECT_COMMAND, &[b"CONNECT\r\n\r\nOK\r\n"]);
    transport.reply_ok(b"AT+CIPMODE=1\r\n");
    transport.reply(b"AT+CIPSEND\r\n", &[b"\r\nOK\r\n", b"\r\n>"]);
}

#[test]
fn test_provision_correct_commands() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    transport.reply(b"AT+RST\r\n", &[b"\r\nOK\r\n", b"ets Jan  8 2013\r\n", b"ready\r\n"]);
    transport.reply(
        b"AT+CIFSR\r\n",
        &[b"+CIFSR:STAIP,\"10.0.0.181\"\r\n+CIFSR:STAMAC,\"10:fe:ed:05:ba:50\"\r\n\r\nOK\r\n"],
    );

    let mut adapter = adapter(transport);
    let report = adapter.provision(&credentials()).unwrap();

    assert_eq!(ModemState::Ready, report.state);
    assert_eq!(ModemState::Ready, adapter.get_state());
    assert_eq!(115_200, report.baud_rate);
    assert_eq!(None, report.joined_network);
    assert!(adapter.is_joined());

    let address = report.address.unwrap();
    assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 181)), address.ipv4);
    assert_eq!("10:fe:ed:05:ba:50", address.mac.unwrap().as_str());

    assert_eq!(
        "+++AT\r\nAT+RST\r\nAT+CWMODE=1\r\nAT+CWJAP?\r\nAT+CWJAP=\"test_wifi\",\"secret\"\r\nAT+CIFSR\r\n",
        adapter.transport().written_string()
    );
}

#[test]
fn test_provision_restart_waits_for_boot() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    transport.reply(b"AT+RST\r\n", &[b"\r\nOK\r\n\r\nready\r\n"]);
    transport.reply(b"AT+CIFSR\r\n", &[b"+CIFSR:STAIP,\"10.0.0.181\"\r\n"]);

    let mut adapter = adapter(transport);
    adapter.set_poll_interval_ms(1_000);
    adapter.provision(&credentials()).unwrap();

    // Escape guard time and boot wait, both in poll interval slices
    assert_eq!(vec![1_000; 6], adapter.session.delay.delays);
    assert_eq!(Some(&5_000), adapter.session.timer.durations.get(1));
}

#[test]
fn test_provision_restart_without_ready_continues() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    transport.reply(b"AT+CIFSR\r\n", &[b"+CIFSR:STAIP,\"10.0.0.181\"\r\n"]);

    let mut adapter = adapter(transport);
    let report = adapter.provision(&credentials()).unwrap();

    assert_eq!(ModemState::Ready, report.state);
    assert_eq!(1, adapter.transport().count("AT+RST"));
}

#[test]
fn test_provision_address_query_failure_is_soft() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    transport.reply(b"AT+RST\r\n", &[b"ready\r\n"]);
    transport.reply(b"AT+CIFSR\r\n", &[b"\r\nERROR\r\n"]);

    let mut adapter = adapter(transport);
    let report = adapter.provision(&credentials()).unwrap();

    assert_eq!(ModemState::Ready, report.state);
    assert_eq!(None, report.address);
}

#[test]
fn test_bring_up_skips_join_if_already_joined() {
    let mut transport = MockTransport::new();
    transport.reply_ok(b"AT\r\n");
    transport.reply_ok(b"AT+CWMODE=1\r\n");
    transport.reply(
        b"AT+CWJAP?\r\n",
        &[b"+CWJAP:\"home\",\"10:fe:ed:05:ba:50\",6,-60\r\n", b"\r\nOK\r\n"],
    );
    script_transparent(&mut transport);

    let mut adapter = adapter(transport);
    let report = adapter.bring_up(&credentials(), &BringupPlan::upload(endpoint())).unwrap();

    assert_eq!(ModemState::Transparent, report.state);
    assert_eq!("home", report.joined_network.unwrap().ssid.unwrap().as_str());
    assert_eq!(0, adapter.transport().count("AT+CWJAP=\""));
    assert_eq!(1, adapter.transport().count("AT+CIPSTART"));
}

#[test]
fn test_bring_up_upload_correct_commands() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    script_transparent(&mut transport);

    let mut adapter = adapter(transport);
    let report = adapter.bring_up(&credentials(), &BringupPlan::upload(endpoint())).unwrap();

    assert_eq!(ModemState::Transparent, report.state);
    assert_eq!(ModemState::Transparent, adapter.get_state());
    assert_eq!(None, report.address);
    assert_eq!(
        "+++AT\r\nAT+CWMODE=1\r\nAT+CWJAP?\r\nAT+CWJAP=\"test_wifi\",\"secret\"\r\n\
         AT+CIPSTART=\"TCP\",\"10.0.0.1\",8080\r\nAT+CIPMODE=1\r\nAT+CIPSEND\r\n",
        adapter.transport().written_string()
    );
}

#[test]
fn test_bring_up_join_timeout_stops_before_connect() {
    let mut transport = MockTransport::new();
    transport.reply_ok(b"AT\r\n");
    transport.reply_ok(b"AT+CWMODE=1\r\n");
    transport.reply(b"AT+CWJAP?\r\n", &[b"No AP\r\n\r\nOK\r\n"]);

    let mut adapter = adapter(transport);
    let error = adapter
        .bring_up(&credentials(), &BringupPlan::upload(endpoint()))
        .unwrap_err();

    assert_eq!(
        BringupError::StepFailed {
            step: Step::Join,
            failure: StepFailure::Timeout { attempts: 1 },
        },
        error
    );
    assert_eq!(Some(Step::Join), error.step());
    assert_eq!(ModemState::Failed, adapter.get_state());
    assert_eq!(Some(&20_000), adapter.session.timer.durations.last());
    assert_eq!(0, adapter.transport().count("AT+CIPSTART"));
}

#[test]
fn test_bring_up_join_rejected() {
    let mut transport = MockTransport::new();
    transport.reply_ok(b"AT\r\n");
    transport.reply_ok(b"AT+CWMODE=1\r\n");
    transport.reply(b"AT+CWJAP?\r\n", &[b"No AP\r\n\r\nOK\r\n"]);
    transport.reply(JOIN_COMMAND, &[b"+CWJAP:1\r\n\r\nFAIL\r\n"]);

    let mut adapter = adapter(transport);
    let error = adapter
        .bring_up(&credentials(), &BringupPlan::upload(endpoint()))
        .unwrap_err();

    assert_eq!(
        BringupError::StepFailed {
            step: Step::Join,
            failure: StepFailure::Rejected("FAIL"),
        },
        error
    );
    assert_eq!("Wi-Fi join failed: modem answered FAIL", error.to_string());
}

#[test]
fn test_bring_up_already_connect_is_success() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    transport.reply(CONNECT_COMMAND, &[b"ALREADY CONNECT\r\n\r\nERROR\r\n"]);
    transport.reply_ok(b"AT+CIPMODE=1\r\n");
    transport.reply(b"AT+CIPSEND\r\n", &[b"\r\nOK\r\n\r\n>"]);

    let mut adapter = adapter(transport);
    let report = adapter.bring_up(&credentials(), &BringupPlan::upload(endpoint())).unwrap();

    assert_eq!(ModemState::Transparent, report.state);
    assert_eq!(1, adapter.transport().count("AT+CIPSEND"));
}

#[test]
fn test_bring_up_tcp_connect_rejected() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    transport.reply(CONNECT_COMMAND, &[b"\r\nERROR\r\nCLOSED\r\n"]);

    let mut adapter = adapter(transport);
    let error = adapter
        .bring_up(&credentials(), &BringupPlan::upload(endpoint()))
        .unwrap_err();

    assert_eq!(Some(Step::TcpConnect), error.step());
    assert_eq!("TCP connect failed: modem answered ERROR", error.to_string());
    assert_eq!(0, adapter.transport().count("AT+CIPMODE"));
}

#[test]
fn test_bring_up_missing_send_prompt() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    transport.reply(CONNECT_COMMAND, &[b"CONNECT\r\n\r\nOK\r\n"]);
    transport.reply_ok(b"AT+CIPMODE=1\r\n");
    transport.reply_ok(b"AT+CIPSEND\r\n");

    let mut adapter = adapter(transport);
    let error = adapter
        .bring_up(&credentials(), &BringupPlan::upload(endpoint()))
        .unwrap_err();

    assert_eq!(
        BringupError::StepFailed {
            step: Step::EnterTransparentSend,
            failure: StepFailure::Timeout { attempts: 2 },
        },
        error
    );
    assert_eq!(ModemState::Failed, adapter.get_state());
    assert_eq!(TunnelError::NotTransparent, adapter.tunnel().err().unwrap());
}

#[test]
fn test_bring_up_connected_target_stays_in_command_mode() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    transport.reply(CONNECT_COMMAND, &[b"CONNECT\r\n\r\nOK\r\n"]);

    let plan = BringupPlan {
        exit_transparent: false,
        restart: false,
        query_join: true,
        query_address: false,
        target: Target::Connected(endpoint()),
    };

    let mut adapter = adapter(transport);
    let report = adapter.bring_up(&credentials(), &plan).unwrap();

    assert_eq!(ModemState::Ready, report.state);
    assert_eq!(0, adapter.transport().count("+++"));
    assert_eq!(0, adapter.transport().count("AT+CIPMODE"));
}

#[test]
fn test_bring_up_without_join_query() {
    let mut transport = MockTransport::new();
    transport.reply_ok(b"AT\r\n");
    transport.reply_ok(b"AT+CWMODE=1\r\n");
    transport.reply(JOIN_COMMAND, &[b"WIFI GOT IP\r\n\r\nOK\r\n"]);

    let plan = BringupPlan {
        exit_transparent: false,
        restart: false,
        query_join: false,
        query_address: false,
        target: Target::Joined,
    };

    let mut adapter = adapter(transport);
    adapter.bring_up(&credentials(), &plan).unwrap();

    assert_eq!(
        "AT\r\nAT+CWMODE=1\r\nAT+CWJAP=\"test_wifi\",\"secret\"\r\n",
        adapter.transport().written_string()
    );
}

#[test]
fn test_bring_up_baud_rate_fallback() {
    let mut transport = MockTransport::new();
    transport.respond_only_at(38_400);
    transport.reply_ok(b"AT\r\n");
    transport.reply(b"AT+CWMODE=1\r\n", &[b"\r\nOK\r\n"]);
    transport.reply(b"AT+CWJAP?\r\n", &[b"+CWJAP:\"test_wifi\",\"10:fe:ed:05:ba:50\",6,-60\r\n\r\nOK\r\n"]);

    let plan = BringupPlan {
        restart: false,
        query_address: false,
        ..BringupPlan::provisioning()
    };

    let mut adapter = adapter(transport);
    let report = adapter.bring_up(&credentials(), &plan).unwrap();

    assert_eq!(38_400, report.baud_rate);
    assert_eq!(&[9_600, 19_200, 38_400], adapter.transport().reopens());
    assert_eq!(38_400, adapter.transport().baud_rate());
}

#[test]
fn test_bring_up_baud_rate_fallback_exhausted() {
    let mut transport = MockTransport::new();
    transport.respond_only_at(1_200);

    let mut adapter = adapter(transport);
    let error = adapter.provision(&credentials()).unwrap_err();

    assert_eq!(
        BringupError::StepFailed {
            step: Step::Liveness,
            failure: StepFailure::Timeout { attempts: 2 },
        },
        error
    );
    assert_eq!(
        &[9_600, 19_200, 38_400, 57_600, 230_400, 115_200],
        adapter.transport().reopens()
    );
    assert_eq!(3 + 5 * 2, adapter.transport().count("AT\r\n"));
    assert_eq!(ModemState::Failed, adapter.get_state());
}

#[test]
fn test_bring_up_cancelled() {
    let token = CancelToken::new();
    token.cancel();

    let mut adapter = adapter(MockTransport::new());
    adapter.set_cancel_token(token);

    let error = adapter.provision(&credentials()).unwrap_err();

    assert_eq!(
        BringupError::Command {
            step: Step::ExitTransparent,
            error: CommandError::Cancelled,
        },
        error
    );
    assert_eq!(0, adapter.transport().write_calls());
}

#[test]
fn test_execute_refused_in_transparent_mode() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    script_transparent(&mut transport);

    let mut adapter = adapter(transport);
    adapter.bring_up(&credentials(), &BringupPlan::upload(endpoint())).unwrap();

    let error = adapter.execute(&CommandRequest::at("+CIFSR")).unwrap_err();
    assert_eq!(CommandError::TransparentMode, error);
    assert_eq!(0, adapter.transport().count("AT+CIFSR"));
}

#[test]
fn test_reset_link() {
    let mut transport = MockTransport::new();
    script_join(&mut transport);
    script_transparent(&mut transport);
    transport.reply_ok(b"AT+CIPMODE=0\r\n");
    transport.reply(b"AT+CIFSR\r\n", &[b"+CIFSR:STAIP,\"10.0.0.181\"\r\n\r\nOK\r\n"]);

    let mut adapter = adapter(transport);
    adapter.bring_up(&credentials(), &BringupPlan::upload(endpoint())).unwrap();
    adapter.reset_link().unwrap();

    assert_eq!(ModemState::Idle, adapter.get_state());
    assert!(adapter.transport().written_string().ends_with("AT+CIPSEND\r\n+++AT+CIPMODE=0\r\n"));
    assert!(adapter.execute(&CommandRequest::query_address()).unwrap().is_success());
}

#[test]
fn test_credentials_length_checked() {
    assert_eq!(
        BringupError::InvalidSsidLength,
        Credentials::new(&"a".repeat(33), "secret").unwrap_err()
    );
    assert_eq!(
        BringupError::InvalidPasswordLength,
        Credentials::new("test_wifi", &"a".repeat(64)).unwrap_err()
    );

    let credentials = Credentials::new(&"a".repeat(32), &"b".repeat(63)).unwrap();
    assert_eq!(32, credentials.ssid().len());
    assert_eq!(63, credentials.password().len());
    assert_eq!(None, BringupError::InvalidSsidLength.step());
}

#[test]
fn test_join_command_escapes_credentials() {
    let credentials = Credentials::new("my,\"net", "pa\\ss").unwrap();
    let request = CommandRequest::join(&credentials);

    assert_eq!(b"AT+CWJAP=\"my\\,\\\"net\",\"pa\\\\ss\"\r\n", request.command());
}

#[test]
fn test_step_names() {
    assert_eq!("Wi-Fi join", Step::Join.to_string());
    assert_eq!("TCP connect", Step::TcpConnect.to_string());
    assert_eq!("AT liveness test", Step::Liveness.to_string());
    assert_eq!("transparent send mode", Step::EnterTransparentSend.to_string());
}

#[test]
fn test_bring_up_join_completes_before_connect() {
    let mut transport = MockTransport::new();
    transport.reply_ok(b"AT\r\n");
    transport.reply_ok(b"AT+CWMODE=1\r\n");
    transport.reply(b"AT+CWJAP?\r\n", &[b"No AP\r\n\r\nOK\r\n"]);
    transport.reply(JOIN_COMMAND, &[b"WIFI CONNECTED\r\n", b"", b"WIFI GOT IP\r\n\r\nOK\r\n"]);

    let mut adapter = adapter(transport);
    let error = adapter
        .bring_up(&credentials(), &BringupPlan::upload(endpoint()))
        .unwrap_err();

    // The final OK belongs to the join, the silent modem fails the connect
    assert_eq!(
        BringupError::StepFailed {
            step: Step::TcpConnect,
            failure: StepFailure::Timeout { attempts: 2 },
        },
        error
    );
    assert_eq!(ModemState::Failed, adapter.get_state());
    assert_eq!(0, adapter.transport().count("AT+CIPMODE"));
    assert_eq!(0, adapter.transport().pending_inbound());
}

#[test]
fn test_bring_up_liveness_retries_after_error() {
    let mut transport = MockTransport::new();
    transport.reply(b"AT\r\n", &[b"\r\nERROR\r\n"]);
    transport.reply_ok(b"AT\r\n");
    transport.reply_ok(b"AT+CWMODE=1\r\n");
    transport.reply(b"AT+CWJAP?\r\n", &[b"+CWJAP:\"test_wifi\",\"10:fe:ed:05:ba:50\",6,-60\r\n\r\nOK\r\n"]);

    let plan = BringupPlan {
        restart: false,
        query_address: false,
        ..BringupPlan::provisioning()
    };

    let mut adapter = adapter(transport);
    let report = adapter.bring_up(&credentials(), &plan).unwrap();

    assert_eq!(ModemState::Ready, report.state);
    assert_eq!(115_200, report.baud_rate);
    assert!(adapter.transport().reopens().is_empty());
    assert_eq!(
        "+++AT\r\nAT\r\nAT+CWMODE=1\r\nAT+CWJAP?\r\n",
        adapter.transport().written_string()
    );
}
