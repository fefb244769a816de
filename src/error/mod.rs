//! Error taxonomy and HTTP error mapping
//!
//! Every failure surfaced by the client is an [`Error`]. Local contract
//! violations (`SourceExhausted`, `IntegrityMismatch`, `IncompleteResponse`)
//! are kept apart from remote rejections, which always carry the HTTP status
//! and whatever error code/message the service returned.
//!
//! # Status mapping
//!
//! | Status | Variant |
//! |--------|---------|
//! | 404 | [`Error::ResourceNotFound`] |
//! | 409, 412 | [`Error::ResourceConflict`] |
//! | other 4xx | [`Error::ClientRequestError`] |
//! | 5xx and anything else non-2xx | [`Error::ServiceError`] |

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed error produced by a transport implementation
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Client errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Source exhausted: a non-seekable source can only be opened once")]
    SourceExhausted,

    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(IntegrityCheck),

    #[error("Incomplete response: missing required header '{header}'")]
    IncompleteResponse { header: &'static str },

    #[error("Resource not found: {0}")]
    ResourceNotFound(ServerError),

    #[error("Resource conflict: {0}")]
    ResourceConflict(ServerError),

    #[error("Client request error: {0}")]
    ClientRequestError(ServerError),

    #[error("Service error: {0}")]
    ServiceError(ServerError),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    /// Wrap an opaque transport failure
    pub fn transport<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Transport(error.into())
    }

    /// HTTP status code of a remote rejection
    pub fn status_code(&self) -> Option<u16> {
        self.server_error().map(|e| e.status)
    }

    /// Error code reported by the service (e.g. `ResourceNotFound`)
    pub fn server_code(&self) -> Option<&str> {
        self.server_error().and_then(|e| e.code.as_deref())
    }

    /// Details of a remote rejection, if this is one
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::ResourceNotFound(e)
            | Error::ResourceConflict(e)
            | Error::ClientRequestError(e)
            | Error::ServiceError(e) => Some(e),
            _ => None,
        }
    }

    /// Whether a caller may reasonably retry the operation.
    ///
    /// Only server-side failures qualify. Transport failures are left to the
    /// transport's own policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ServiceError(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SourceExhausted => "source_exhausted",
            Error::IntegrityMismatch(_) => "integrity_mismatch",
            Error::IncompleteResponse { .. } => "incomplete_response",
            Error::ResourceNotFound(_) => "resource_not_found",
            Error::ResourceConflict(_) => "resource_conflict",
            Error::ClientRequestError(_) => "client_request",
            Error::ServiceError(_) => "service",
            Error::InvalidPath(_) => "invalid_path",
            Error::InvalidHeader(_) => "invalid_header",
            Error::Encryption(_) => "encryption",
            Error::Transport(_) => "transport",
            Error::Io(_) => "io",
            Error::Config(_) => "config",
        }
    }
}

/// The integrity check that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// Declared (or known) byte count differs from what the source produced
    Length { expected: u64, actual: u64 },
    /// Checksum computed locally differs from the one the service computed
    Checksum { expected: String, actual: String },
}

impl fmt::Display for IntegrityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityCheck::Length { expected, actual } => write!(
                f,
                "expected {} bytes but the source produced {}",
                expected, actual
            ),
            IntegrityCheck::Checksum { expected, actual } => write!(
                f,
                "expected checksum {} but the service computed {}",
                expected, actual
            ),
        }
    }
}

/// A non-2xx response, kept verbatim for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub status: u16,
    pub code: Option<String>,
    pub message: Option<String>,
    pub request_id: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}", self.status)?;
        if let Some(code) = &self.code {
            write!(f, " {}", code)?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        if let Some(request_id) = &self.request_id {
            write!(f, " (request id {})", request_id)?;
        }
        Ok(())
    }
}

/// JSON error body returned by the service
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Convert a non-2xx response into the error taxonomy.
pub fn map_response(status: StatusCode, headers: &HeaderMap, body: &Bytes) -> Error {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (code, message) = parse_error_body(body);

    let server_error = ServerError {
        status: status.as_u16(),
        code,
        message,
        request_id,
    };

    match status.as_u16() {
        404 => Error::ResourceNotFound(server_error),
        409 | 412 => Error::ResourceConflict(server_error),
        400..=499 => Error::ClientRequestError(server_error),
        _ => Error::ServiceError(server_error),
    }
}

fn parse_error_body(body: &Bytes) -> (Option<String>, Option<String>) {
    if body.is_empty() {
        return (None, None);
    }

    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => (parsed.code, parsed.message),
        Err(e) => {
            tracing::warn!(error = %e, "Error body is not JSON, keeping it as the message");
            let text = String::from_utf8_lossy(body).trim().to_string();
            (None, (!text.is_empty()).then_some(text))
        }
    }
}
