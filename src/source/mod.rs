//! Upload content sources
//!
//! A [`ContentSource`] is one type covering every kind of input the client
//! can upload: encoded text, byte buffers, files and arbitrary async readers.
//! Each variant reports whether its length is known up front and whether it
//! can be opened more than once.
//!
//! | Kind | Known length | Seekable |
//! |------|--------------|----------|
//! | text | yes | yes |
//! | bytes | yes | yes |
//! | file | yes (from metadata) | yes (reopened) |
//! | stream | no | no |
//!
//! # Example
//!
//! ```
//! use objput::source::{ContentSource, TextEncoding};
//!
//! let source = ContentSource::text("hello", TextEncoding::Utf16);
//! assert_eq!(source.known_length(), Some(12));
//! assert!(source.is_seekable());
//! ```

use crate::error::{Error, Result};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

mod encoding;

pub use encoding::{TextEncoding, UnsupportedEncoding};

/// Read size used when streaming files and readers
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Byte channel produced by [`ContentSource::open`]
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Input kind, used by content-type resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Text,
    Bytes,
    File,
    Stream,
}

enum Inner {
    Text { data: Bytes, encoding: TextEncoding },
    Bytes(Bytes),
    File { path: PathBuf, length: u64 },
    Stream { reader: Option<BoxReader> },
}

/// Data to upload
pub struct ContentSource {
    inner: Inner,
}

impl ContentSource {
    /// Text encoded with `encoding`
    pub fn text(text: &str, encoding: TextEncoding) -> Self {
        Self {
            inner: Inner::Text {
                data: Bytes::from(encoding.encode(text)),
                encoding,
            },
        }
    }

    /// Raw bytes
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self {
            inner: Inner::Bytes(data.into()),
        }
    }

    /// A file on the local filesystem.
    ///
    /// The length is read from the file metadata now; the file itself is
    /// only opened by [`open`](Self::open).
    pub async fn file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }

        Ok(Self {
            inner: Inner::File {
                path,
                length: metadata.len(),
            },
        })
    }

    /// A single-pass reader of unknown length
    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: Inner::Stream {
                reader: Some(Box::new(reader)),
            },
        }
    }

    /// Input kind
    pub fn kind(&self) -> SourceKind {
        match &self.inner {
            Inner::Text { .. } => SourceKind::Text,
            Inner::Bytes(_) => SourceKind::Bytes,
            Inner::File { .. } => SourceKind::File,
            Inner::Stream { .. } => SourceKind::Stream,
        }
    }

    /// Exact byte count, when known without consuming the source
    pub fn known_length(&self) -> Option<u64> {
        match &self.inner {
            Inner::Text { data, .. } | Inner::Bytes(data) => Some(data.len() as u64),
            Inner::File { length, .. } => Some(*length),
            Inner::Stream { .. } => None,
        }
    }

    /// Whether [`open`](Self::open) may be called more than once
    pub fn is_seekable(&self) -> bool {
        !matches!(self.inner, Inner::Stream { .. })
    }

    /// Encoding of text content
    pub fn text_encoding(&self) -> Option<TextEncoding> {
        match &self.inner {
            Inner::Text { encoding, .. } => Some(*encoding),
            _ => None,
        }
    }

    /// Path of file content
    pub fn file_path(&self) -> Option<&Path> {
        match &self.inner {
            Inner::File { path, .. } => Some(path),
            _ => None,
        }
    }

    /// In-memory content (text or bytes)
    pub fn in_memory(&self) -> Option<&Bytes> {
        match &self.inner {
            Inner::Text { data, .. } | Inner::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// Open the source for reading.
    ///
    /// A file handle lives inside the returned stream and is closed when the
    /// stream is dropped, whether or not it was read to the end. A stream
    /// source hands out its reader once; later calls fail with
    /// [`Error::SourceExhausted`].
    pub async fn open(&mut self) -> Result<ByteStream> {
        match &mut self.inner {
            Inner::Text { data, .. } | Inner::Bytes(data) => Ok(once(data.clone())),
            Inner::File { path, .. } => {
                let file = tokio::fs::File::open(&*path).await?;
                Ok(ReaderStream::with_capacity(file, READ_CHUNK_SIZE).boxed())
            }
            Inner::Stream { reader } => {
                let reader = reader.take().ok_or(Error::SourceExhausted)?;
                Ok(ReaderStream::with_capacity(reader, READ_CHUNK_SIZE).boxed())
            }
        }
    }
}

fn once(data: Bytes) -> ByteStream {
    if data.is_empty() {
        stream::empty().boxed()
    } else {
        stream::iter([Ok(data)]).boxed()
    }
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ContentSource");
        d.field("kind", &self.kind())
            .field("known_length", &self.known_length());
        match &self.inner {
            Inner::Text { encoding, .. } => d.field("encoding", encoding),
            Inner::File { path, .. } => d.field("path", path),
            Inner::Stream { reader } => d.field("consumed", &reader.is_none()),
            Inner::Bytes(_) => &mut d,
        };
        d.finish()
    }
}

impl From<Bytes> for ContentSource {
    fn from(value: Bytes) -> Self {
        ContentSource::bytes(value)
    }
}

impl From<Vec<u8>> for ContentSource {
    fn from(value: Vec<u8>) -> Self {
        ContentSource::bytes(value)
    }
}

impl From<&'static [u8]> for ContentSource {
    fn from(value: &'static [u8]) -> Self {
        ContentSource::bytes(Bytes::from_static(value))
    }
}

/// Read a whole stream into memory
pub async fn collect(mut stream: ByteStream) -> std::io::Result<Bytes> {
    let mut buffer = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
