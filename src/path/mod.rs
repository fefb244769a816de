//! Object path normalization
//!
//! Callers always deal in logical paths (`/acct/stor/my file.txt`). On the
//! wire every byte outside the unreserved set is percent-encoded while `/`
//! separators stay intact. A `%` in a logical path is data, so it is encoded
//! like any other reserved character and never mistaken for an escape.

use crate::error::{Error, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters that are percent-encoded in a path.
///
/// Everything except ASCII alphanumerics, the RFC 3986 unreserved
/// punctuation (`-`, `.`, `_`, `~`) and the `/` separator.
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Check that a logical path can be sent at all
pub fn validate(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidPath("path is empty".into()));
    }
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(format!(
            "path must be absolute: '{}'",
            path
        )));
    }
    if path.contains('\0') {
        return Err(Error::InvalidPath("path contains a NUL byte".into()));
    }
    Ok(())
}

/// Encode a logical path into its wire form
pub fn encode(path: &str) -> Result<String> {
    validate(path)?;
    Ok(utf8_percent_encode(path, PATH_ENCODE_SET).to_string())
}

/// Decode a wire path back into the logical path
pub fn decode(wire: &str) -> Result<String> {
    percent_decode_str(wire)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| Error::InvalidPath(format!("'{}' is not valid UTF-8: {}", wire, e)))
}
