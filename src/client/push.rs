use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;
use tracing::warn;

use crate::config::ClientConfig;
use crate::wal::record::{Entry, LabelSet};

/// Longest error message kept from a failed push response.
const MAX_ERR_MSG_LEN: usize = 1024;

pub const TENANT_HEADER: &str = "X-Scope-OrgID";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned HTTP status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid push payload: {0}")]
    Payload(String),
}

impl PushError {
    /// HTTP status behind the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            PushError::Status { status, .. } => Some(*status),
            PushError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub streams: Vec<PushStream>,
}

/// One stream: its labels and `[unix nanos, line]` pairs in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushStream {
    pub stream: LabelSet,
    pub values: Vec<[String; 2]>,
}

impl PushStream {
    pub fn new(stream: LabelSet, entries: &[Entry]) -> Self {
        let values = entries
            .iter()
            .map(|e| {
                let nanos = e.timestamp.timestamp_nanos_opt().unwrap_or_default();
                [nanos.to_string(), e.line.clone()]
            })
            .collect();
        Self { stream, values }
    }
}

pub fn encode_push_request(request: &PushRequest) -> Result<Vec<u8>, std::io::Error> {
    let json = serde_json::to_vec(request)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()
}

/// Receiving side of [`encode_push_request`].
pub fn decode_push_request(body: &[u8]) -> Result<PushRequest, PushError> {
    let mut json = Vec::new();
    GzDecoder::new(body)
        .read_to_end(&mut json)
        .map_err(|e| PushError::Payload(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| PushError::Payload(e.to_string()))
}

/// Transport for encoded batches.
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Pushes one encoded batch. Returns the HTTP status on success.
    async fn push(&self, tenant_id: &str, body: Vec<u8>) -> Result<u16, PushError>;
}

/// Pushes batches to the configured endpoint over HTTP.
#[derive(Debug)]
pub struct HttpPushClient {
    url: reqwest::Url,
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpPushClient {
    pub fn new(config: &ClientConfig) -> Result<Self, PushError> {
        let url = reqwest::Url::parse(&config.url).map_err(|e| PushError::InvalidUrl {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("logship/", env!("CARGO_PKG_VERSION"))),
        );

        // Custom headers never override the ones above. A custom tenant header
        // is kept and only replaced when a batch carries its own tenant.
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| PushError::InvalidHeader(name.clone()))?;
            if headers.contains_key(&name) {
                warn!(header = %name, "Custom header collides with a reserved one, skipping");
                continue;
            }
            let value = HeaderValue::from_str(value)
                .map_err(|_| PushError::InvalidHeader(name.to_string()))?;
            headers.insert(name, value);
        }

        Ok(Self {
            url,
            client,
            headers,
        })
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    fn request_headers(&self, tenant_id: &str) -> Result<HeaderMap, PushError> {
        let mut headers = self.headers.clone();
        if !tenant_id.is_empty() {
            let value = HeaderValue::from_str(tenant_id)
                .map_err(|_| PushError::InvalidHeader(TENANT_HEADER.to_string()))?;
            headers.insert(TENANT_HEADER, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl PushClient for HttpPushClient {
    async fn push(&self, tenant_id: &str, body: Vec<u8>) -> Result<u16, PushError> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers(tenant_id)?)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let text = read_error_prefix(response).await;
        Err(PushError::Status {
            status: status.as_u16(),
            message: first_line(&text),
        })
    }
}

/// Reads at most [`MAX_ERR_MSG_LEN`] bytes of an error response body.
async fn read_error_prefix(mut response: reqwest::Response) -> String {
    let mut buf = Vec::with_capacity(MAX_ERR_MSG_LEN);
    while buf.len() < MAX_ERR_MSG_LEN {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(MAX_ERR_MSG_LEN);
    String::from_utf8_lossy(&buf).into_owned()
}

fn first_line(body: &str) -> String {
    body.lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(MAX_ERR_MSG_LEN)
        .collect()
}
