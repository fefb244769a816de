//! Content-Type resolution
//!
//! Resolution order, first match wins:
//!
//! 1. An explicit Content-Type from the caller, used verbatim.
//! 2. Text content: `text/plain; charset=<encoding>`.
//! 3. Files: extension lookup, then magic-number sniffing. Byte buffers:
//!    magic-number sniffing only.
//! 4. `application/octet-stream`.
//!
//! Detection never fails. Unreadable files, empty buffers and unknown
//! signatures all fall through to the default.

use crate::source::{ContentSource, SourceKind};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Content type used when nothing better is known
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Number of leading bytes inspected when sniffing
const SNIFF_LEN: u64 = 512;

/// Resolved content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentMetadata {
    content_type: String,
    charset: Option<String>,
}

impl ContentMetadata {
    /// Metadata for a type with no charset
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            charset: None,
        }
    }

    /// Caller-supplied header value, kept as given
    pub fn explicit(value: &str) -> Self {
        let charset = value
            .parse::<mime::Mime>()
            .ok()
            .and_then(|m| m.get_param(mime::CHARSET).map(|c| c.as_str().to_string()));

        Self {
            content_type: value.to_string(),
            charset,
        }
    }

    /// `text/plain` with a charset parameter
    pub fn text(charset: &str) -> Self {
        Self {
            content_type: format!("text/plain; charset={}", charset),
            charset: Some(charset.to_string()),
        }
    }

    /// Full header value, including any charset parameter
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Charset parameter, if any
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    /// Type without parameters (`text/plain`)
    pub fn essence(&self) -> &str {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
    }
}

impl Default for ContentMetadata {
    fn default() -> Self {
        ContentMetadata::new(OCTET_STREAM)
    }
}

/// Resolve the content type of `source`
pub async fn resolve(explicit: Option<&str>, source: &ContentSource) -> ContentMetadata {
    if let Some(value) = explicit.map(str::trim).filter(|v| !v.is_empty()) {
        return ContentMetadata::explicit(value);
    }

    match source.kind() {
        SourceKind::Text => source
            .text_encoding()
            .map(|encoding| ContentMetadata::text(encoding.name()))
            .unwrap_or_default(),
        SourceKind::Bytes => source
            .in_memory()
            .and_then(|data| sniff(data))
            .map(ContentMetadata::new)
            .unwrap_or_default(),
        SourceKind::File => match source.file_path() {
            Some(path) => detect_file(path).await,
            None => ContentMetadata::default(),
        },
        SourceKind::Stream => ContentMetadata::default(),
    }
}

async fn detect_file(path: &Path) -> ContentMetadata {
    if let Some(content_type) = from_extension(path) {
        return ContentMetadata::new(content_type);
    }

    match read_head(path).await {
        Ok(head) => sniff(&head).map(ContentMetadata::new).unwrap_or_default(),
        Err(e) => {
            tracing::debug!(
                path = %path.display(),
                error = %e,
                "Could not read file for content sniffing"
            );
            ContentMetadata::default()
        }
    }
}

async fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    file.take(SNIFF_LEN).read_to_end(&mut head).await?;
    Ok(head)
}

/// Content type implied by a file extension
pub fn from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let content_type = match ext.as_str() {
        "txt" | "text" | "log" => "text/plain",
        "htm" | "html" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "jpg" | "jpeg" | "jpe" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "wasm" => "application/wasm",
        _ => return None,
    };
    Some(content_type)
}

/// Content type implied by well-known binary signatures.
///
/// Text is never guessed from bytes alone.
pub fn sniff(data: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (&[0xFF, 0xD8, 0xFF], "image/jpeg"),
        (&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A], "image/png"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\0asm", "application/wasm"),
    ];

    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    // Two-byte magics only count with their fixed header fields
    if data.starts_with(&[0x1F, 0x8B, 0x08]) {
        return Some("application/gzip");
    }
    if is_bmp(data) {
        return Some("image/bmp");
    }

    SIGNATURES
        .iter()
        .find(|(magic, _)| data.starts_with(magic))
        .map(|(_, content_type)| *content_type)
}

/// `BM` followed by a known DIB header size at offset 14
fn is_bmp(data: &[u8]) -> bool {
    const DIB_HEADER_SIZES: [u32; 5] = [12, 40, 56, 108, 124];

    match data.get(14..18) {
        Some(size) if data.starts_with(b"BM") => {
            let size = u32::from_le_bytes([size[0], size[1], size[2], size[3]]);
            DIB_HEADER_SIZES.contains(&size)
        }
        _ => false,
    }
}
