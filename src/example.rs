//! Mocks for doc examples
use crate::transport::{Transport, TransportError};
use crate::upload::BOUNDARY;
use embedded_hal::delay::DelayNs;
use fugit::{TimerDurationU32, TimerInstantU32};
use fugit_timer::Timer;

const RECOGNITION_JSON: &str = r#"{"results":[{"label":"cat","confidence":0.93}]}"#;

/// Modem mock answering the commands of a bring-up and a single HTTP request in transparent mode
#[derive(Default)]
pub struct ExampleTransport {
    /// Data returned by the next poll
    rx: Vec<u8>,

    /// True after the send prompt until the escape sequence
    transparent: bool,

    /// Bytes received in transparent mode
    payload: Vec<u8>,
}

impl ExampleTransport {
    fn respond(&mut self, data: &[u8]) {
        self.rx.extend_from_slice(data);
    }

    fn respond_http(&mut self, json: &str) {
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            json.len(),
            json
        );
        self.respond(reply.as_bytes());
    }

    fn receive_payload(&mut self, data: &[u8]) {
        self.payload.extend_from_slice(data);

        let upload_end = format!("\r\n--{BOUNDARY}--\r\n");
        if self.payload.ends_with(upload_end.as_bytes()) {
            self.payload.clear();
            self.respond_http(RECOGNITION_JSON);
        } else if self.payload.starts_with(b"GET ") && self.payload.ends_with(b"\r\n\r\n") {
            self.payload.clear();
            self.respond_http(r#"{"results":[]}"#);
        }
    }
}

impl Transport for ExampleTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if data == b"+++" {
            self.transparent = false;
            return Ok(data.len());
        }

        if self.transparent {
            self.receive_payload(data);
            return Ok(data.len());
        }

        // Command echo
        self.respond(data);

        match data {
            b"AT+RST\r\n" => self.respond(b"\r\nOK\r\n\r\nets Jan  8 2013,rst cause:2\r\n\r\nready\r\n"),
            b"AT+CWJAP?\r\n" => self.respond(b"No AP\r\n\r\nOK\r\n"),
            b"AT+CWJAP=\"test_wifi\",\"secret\"\r\n" => self.respond(b"WIFI CONNECTED\r\nWIFI GOT IP\r\n\r\nOK\r\n"),
            b"AT+CIFSR\r\n" => {
                self.respond(b"+CIFSR:STAIP,\"10.0.0.181\"\r\n+CIFSR:STAMAC,\"10:fe:ed:05:ba:50\"\r\n\r\nOK\r\n")
            }
            b"AT+CIPSTART=\"TCP\",\"10.0.0.1\",8080\r\n" => self.respond(b"CONNECT\r\n\r\nOK\r\n"),
            b"AT+CIPSEND\r\n" => {
                self.respond(b"\r\nOK\r\n\r\n>");
                self.transparent = true;
            }
            _ => self.respond(b"\r\nOK\r\n"),
        }

        Ok(data.len())
    }

    fn poll(&mut self) -> Result<Vec<u8>, TransportError> {
        Ok(core::mem::take(&mut self.rx))
    }

    fn baud_rate(&self) -> u32 {
        115_200
    }

    fn reopen(&mut self, _baud_rate: u32) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Timer mock
#[derive(Default)]
pub struct ExampleTimer {}

impl Timer<1_000_000> for ExampleTimer {
    type Error = u32;

    fn now(&mut self) -> TimerInstantU32<1000000> {
        unimplemented!()
    }

    fn start(&mut self, _duration: TimerDurationU32<1000000>) -> Result<(), Self::Error> {
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), Self::Error> {
        unimplemented!()
    }

    fn wait(&mut self) -> nb::Result<(), Self::Error> {
        nb::Result::Err(nb::Error::WouldBlock)
    }
}

/// Delay mock, returns immediately
#[derive(Copy, Clone, Default)]
pub struct ExampleDelay;

impl DelayNs for ExampleDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}
