//! # Image upload
//!
//! Encodes a JPEG image as `multipart/form-data` HTTP POST request and sends it through the
//! transparent tunnel. The server answers with a JSON object listing recognized labels:
//!
//! ````text
//! {"results":[{"label":"cat","confidence":0.93}]}
//! ````
//!
//! ## Example
//!
//! ````
//! # use esp_at_link::example::{ExampleDelay, ExampleTimer, ExampleTransport};
//! use esp_at_link::upload::UploadJob;
//! use esp_at_link::wifi::{Adapter, Credentials, Endpoint, ModemState};
//!
//! let mut adapter: Adapter<_, _, _, 1_000_000> =
//!     Adapter::new(ExampleTransport::default(), ExampleTimer::default(), ExampleDelay);
//!
//! let credentials = Credentials::new("test_wifi", "secret").unwrap();
//! let job = UploadJob::new(vec![0xFF, 0xD8, 0xFF, 0xD9], Endpoint::new("10.0.0.1", 8080));
//! let report = adapter.upload(&credentials, &job).unwrap();
//!
//! assert_eq!(Some(200), report.status);
//! assert_eq!("cat", report.results[0].label);
//! assert_eq!(ModemState::Transparent, adapter.get_state());
//! ````
use crate::transport::Transport;
use crate::tunnel::{extract_json, http_status, reply_complete, TunnelConfig, TunnelError};
use crate::wifi::{Adapter, BringupError, BringupPlan, Credentials, Endpoint};
use core::fmt;
use embedded_hal::delay::DelayNs;
use fugit_timer::Timer;
use log::info;
use serde::Deserialize;

/// Fixed multipart boundary
pub const BOUNDARY: &str = "----WebKitFormBoundaryQtEsp8266";

/// Path of the upload endpoint
const UPLOAD_PATH: &str = "/upload";

/// Builds the complete HTTP request for the given JPEG image.
///
/// The body carries the image as form field `image` with file name `image.jpg`. `Content-Length`
/// is the exact size of the body including the boundary lines.
pub fn encode_request(image: &[u8], host: &str, port: u16) -> Vec<u8> {
    let body = encode_body(image);

    let mut request = format!(
        "POST {UPLOAD_PATH} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Content-Type: multipart/form-data; boundary={BOUNDARY}\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();

    request.extend_from_slice(&body);
    request
}

/// Multipart body with a single file field
fn encode_body(image: &[u8]) -> Vec<u8> {
    let head = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"image\"; filename=\"image.jpg\"\r\n\
         Content-Type: image/jpeg\r\n\r\n"
    );
    let tail = format!("\r\n--{BOUNDARY}--\r\n");

    let mut body = Vec::with_capacity(head.len() + image.len() + tail.len());
    body.extend_from_slice(head.as_bytes());
    body.extend_from_slice(image);
    body.extend_from_slice(tail.as_bytes());
    body
}

/// Image and destination of an upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadJob {
    /// JPEG encoded image
    pub payload: Vec<u8>,

    pub endpoint: Endpoint,

    /// Max. bytes written to the link at once
    pub chunk_size: usize,
}

impl UploadJob {
    pub fn new(payload: Vec<u8>, endpoint: Endpoint) -> Self {
        Self {
            payload,
            endpoint,
            chunk_size: TunnelConfig::default().chunk_size,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// One recognized label
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Recognition {
    pub label: String,

    /// Between 0 and 1
    pub confidence: f64,
}

#[derive(Deserialize)]
struct RecognitionReply {
    results: Vec<Recognition>,
}

/// Decodes the `{"results":[...]}` reply object
pub fn parse_results(json: &[u8]) -> Result<Vec<Recognition>, UploadError> {
    let reply: RecognitionReply =
        serde_json::from_slice(json).map_err(|error| UploadError::InvalidResults(error.to_string()))?;

    if let Some(invalid) = reply.results.iter().find(|result| !(0.0..=1.0).contains(&result.confidence)) {
        return Err(UploadError::InvalidResults(format!(
            "confidence {} of '{}' out of range",
            invalid.confidence, invalid.label
        )));
    }

    Ok(reply.results)
}

/// Result of a successful upload
#[derive(Clone, Debug, PartialEq)]
pub struct UploadReport {
    /// Bytes written through the tunnel, i.e. the request size
    pub bytes_sent: usize,

    /// HTTP status, None if the reply had no status line
    pub status: Option<u16>,

    /// Extracted JSON text
    pub json: String,

    pub results: Vec<Recognition>,
}

/// Possible errors of an upload
#[derive(Clone, Debug, PartialEq)]
pub enum UploadError {
    /// Bring-up to the transparent mode failed
    Bringup(BringupError),

    /// Sending the request or receiving the reply failed
    Tunnel(TunnelError),

    /// Server answered with a non 2xx status
    HttpStatus(u16),

    /// Reply JSON does not describe recognition results
    InvalidResults(String),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bringup(error) => write!(f, "{error}"),
            Self::Tunnel(error) => write!(f, "upload failed: {error}"),
            Self::HttpStatus(status) => write!(f, "server answered HTTP {status}"),
            Self::InvalidResults(message) => write!(f, "unable to parse results: {message}"),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<BringupError> for UploadError {
    fn from(error: BringupError) -> Self {
        Self::Bringup(error)
    }
}

impl From<TunnelError> for UploadError {
    fn from(error: TunnelError) -> Self {
        Self::Tunnel(error)
    }
}

impl<P: Transport, T: Timer<TIMER_HZ>, D: DelayNs, const TIMER_HZ: u32> Adapter<P, T, D, TIMER_HZ> {
    /// Uploads the image and returns the recognition results.
    ///
    /// Runs the full bring-up up to the transparent send mode first. The link stays in transparent
    /// mode afterwards, see [Adapter::reset_link].
    pub fn upload(&mut self, credentials: &Credentials, job: &UploadJob) -> Result<UploadReport, UploadError> {
        let request = encode_request(&job.payload, job.endpoint.host(), job.endpoint.port());
        self.bring_up(credentials, &BringupPlan::upload(job.endpoint.clone()))?;

        let config = TunnelConfig {
            chunk_size: job.chunk_size,
            ..self.tunnel_config
        };
        let mut tunnel = self.tunnel_with(config)?;

        let bytes_sent = tunnel.send(&request)?;
        info!("Uploaded {} bytes, awaiting reply", bytes_sent);

        let reply = tunnel.await_response(reply_complete, config.response_timeout_ms)?;

        let status = http_status(&reply);
        if let Some(code) = status.filter(|code| !(200..300).contains(code)) {
            return Err(UploadError::HttpStatus(code));
        }

        let json = extract_json(&reply)?;
        let results = parse_results(json)?;

        Ok(UploadReport {
            bytes_sent,
            status,
            json: String::from_utf8_lossy(json).into_owned(),
            results,
        })
    }
}
