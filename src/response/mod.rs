//! Object descriptor materialization
//!
//! A successful response must carry `ETag`, `Last-Modified`, `Content-Type`
//! and `Content-Length`. A 2xx response missing any of them is reported as
//! [`Error::IncompleteResponse`] instead of a half-filled descriptor.

use crate::crypto::is_encryption_header;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use serde::Serialize;
use std::collections::BTreeMap;

/// Prefix of user metadata headers
pub const METADATA_PREFIX: &str = "m-";

/// Canonical metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectDescriptor {
    /// Logical path, as the caller wrote it
    pub path: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub content_type: String,
    pub content_length: u64,
    /// `m-*` headers other than the encryption ones
    pub metadata: BTreeMap<String, String>,
    /// Request id echoed by the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Build a descriptor from response headers
pub fn materialize(path: &str, headers: &HeaderMap) -> Result<ObjectDescriptor> {
    let etag = required(headers, &ETAG, "ETag")?
        .trim_matches('"')
        .to_string();

    let last_modified = parse_http_date(required(headers, &LAST_MODIFIED, "Last-Modified")?)
        .ok_or(Error::IncompleteResponse {
            header: "Last-Modified",
        })?;

    let content_type = required(headers, &CONTENT_TYPE, "Content-Type")?.to_string();

    let content_length = required(headers, &CONTENT_LENGTH, "Content-Length")?
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::IncompleteResponse {
            header: "Content-Length",
        })?;

    let metadata = headers
        .iter()
        .filter(|(name, _)| {
            name.as_str().starts_with(METADATA_PREFIX) && !is_encryption_header(name)
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(ObjectDescriptor {
        path: path.to_string(),
        etag,
        last_modified,
        content_type,
        content_length,
        metadata,
        request_id,
    })
}

fn required<'a>(
    headers: &'a HeaderMap,
    name: &HeaderName,
    label: &'static str,
) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .ok_or(Error::IncompleteResponse { header: label })
}

/// Parse an HTTP date (RFC 7231 IMF-fixdate, or RFC 3339 as a fallback)
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a timestamp as an HTTP date
pub fn format_http_date(time: &DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn complete_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"abc123\""));
        headers.insert(
            LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=UTF-8"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers
    }

    #[test]
    fn test_complete_response() {
        let descriptor = materialize("/acct/stor/a b", &complete_headers()).unwrap();

        assert_eq!(descriptor.path, "/acct/stor/a b");
        assert_eq!(descriptor.etag, "abc123");
        assert_eq!(
            descriptor.last_modified,
            Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap()
        );
        assert_eq!(descriptor.content_type, "text/plain; charset=UTF-8");
        assert_eq!(descriptor.content_length, 42);
        assert!(descriptor.metadata.is_empty());
    }

    #[test]
    fn test_each_required_header() {
        for (name, label) in [
            (ETAG, "ETag"),
            (LAST_MODIFIED, "Last-Modified"),
            (CONTENT_TYPE, "Content-Type"),
            (CONTENT_LENGTH, "Content-Length"),
        ] {
            let mut headers = complete_headers();
            headers.remove(&name);

            match materialize("/a/stor/x", &headers) {
                Err(Error::IncompleteResponse { header }) => assert_eq!(header, label),
                other => panic!("expected IncompleteResponse for {}, got {:?}", label, other),
            }
        }
    }

    #[test]
    fn test_unparseable_values_are_incomplete() {
        let mut headers = complete_headers();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert!(matches!(
            materialize("/a/stor/x", &headers),
            Err(Error::IncompleteResponse { header: "Content-Length" })
        ));

        let mut headers = complete_headers();
        headers.insert(LAST_MODIFIED, HeaderValue::from_static("yesterday"));
        assert!(matches!(
            materialize("/a/stor/x", &headers),
            Err(Error::IncompleteResponse { header: "Last-Modified" })
        ));
    }

    #[test]
    fn test_user_metadata_excludes_encryption_headers() {
        let mut headers = complete_headers();
        headers.insert("m-color", HeaderValue::from_static("blue"));
        headers.insert("m-encrypt-type", HeaderValue::from_static("client/1"));
        headers.insert("x-request-id", HeaderValue::from_static("req-9"));

        let descriptor = materialize("/a/stor/x", &headers).unwrap();
        assert_eq!(descriptor.metadata.len(), 1);
        assert_eq!(descriptor.metadata["m-color"], "blue");
        assert_eq!(descriptor.request_id.as_deref(), Some("req-9"));
    }

    #[test]
    fn test_http_date_round_trip() {
        let time = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 1).unwrap();
        let formatted = format_http_date(&time);
        assert_eq!(formatted, "Thu, 29 Feb 2024 23:59:01 GMT");
        assert_eq!(parse_http_date(&formatted), Some(time));
        assert_eq!(
            parse_http_date("2024-02-29T23:59:01Z"),
            Some(time)
        );
    }
}
