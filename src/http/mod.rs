//! HTTP transport
//!
//! The client never talks to the network directly. It hands a
//! [`TransportRequest`] to a [`Transport`] and gets back the status, headers
//! and body. [`HttpTransport`] is the reqwest-backed implementation; tests
//! and embedders can supply their own (e.g. to add request signing or
//! connection policies).
//!
//! # Tracing
//!
//! Every request creates a span named `http.request` with the method, the
//! wire path, the body kind and the response status.
//!
//! # Timeouts
//!
//! `timeout_seconds` bounds connection setup for every request, and the
//! whole exchange for bodiless and buffered requests. Streamed bodies have
//! no overall deadline, since their duration grows with the object size.

use crate::config::ClientConfig;
use crate::error::{BoxError, Error, Result};
use crate::source::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode};
use std::fmt;
use std::time::Duration;

/// Request body
pub enum RequestBody {
    /// No body (GET, HEAD, DELETE)
    Empty,
    /// Fixed bytes, sent with an exact Content-Length
    Bytes(Bytes),
    /// Streamed body. Sent chunked unless a Content-Length header is set.
    Stream(ByteStream),
}

impl RequestBody {
    /// Label for logs and spans
    pub fn kind(&self) -> &'static str {
        match self {
            RequestBody::Empty => "empty",
            RequestBody::Bytes(_) => "bytes",
            RequestBody::Stream(_) => "stream",
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Request handed to a transport
#[derive(Debug)]
pub struct TransportRequest {
    pub method: Method,
    /// Percent-encoded path
    pub path: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// Response returned by a transport
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Executes HTTP requests on behalf of the client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and return the response, whatever its status.
    ///
    /// Only failures to obtain a response are errors.
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, BoxError>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    endpoint: String,
    request_timeout: Duration,
    default_headers: HeaderMap,
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport from client configuration
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let request_timeout = Duration::from_secs(config.timeout_seconds);
        let http_client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(Error::transport)?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| Error::InvalidHeader(format!("user_agent: {}", e)))?,
        );
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidHeader(format!("{}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidHeader(format!("{}: {}", name, e)))?;
            default_headers.insert(name, value);
        }

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            request_timeout,
            default_headers,
            http_client,
        })
    }

    /// Base URL requests are sent to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Full URL for an encoded path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(
        name = "http.request",
        skip(self, request),
        fields(
            http.method = %request.method,
            http.path = %request.path,
            http.body = request.body.kind(),
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, BoxError> {
        let mut headers = self.default_headers.clone();
        headers.extend(request.headers);

        let mut builder = self
            .http_client
            .request(request.method, self.url(&request.path))
            .headers(headers);

        builder = match request.body {
            RequestBody::Empty => builder.timeout(self.request_timeout),
            RequestBody::Bytes(bytes) => builder.timeout(self.request_timeout).body(bytes),
            RequestBody::Stream(stream) => builder.body(reqwest::Body::wrap_stream(stream)),
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        tracing::Span::current().record("http.status_code", status.as_u16());

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
