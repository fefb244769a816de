//! Object client
//!
//! [`ObjectClient`] composes path encoding, content-type resolution,
//! optional encryption and transfer selection into a single PUT, and offers
//! the read operations needed to get the object back.
//!
//! # Example
//!
//! ```no_run
//! use objput::{client::{ObjectClient, PutOptions}, config::Config};
//!
//! # async fn run() -> objput::Result<()> {
//! let client = ObjectClient::from_config(&Config::default())?;
//! let descriptor = client
//!     .put_str("/acct/stor/hello.txt", "hello", PutOptions::default())
//!     .await?;
//! assert_eq!(descriptor.content_type, "text/plain; charset=UTF-8");
//! # Ok(())
//! # }
//! ```
//!
//! # Tracing
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | put | `objput.put` | path, source kind, transfer mode, bytes, etag, status_code |
//! | head | `objput.head` | path, status_code |
//! | get | `objput.get` | path, bytes, status_code |
//! | delete | `objput.delete` | path, status_code |
//!
//! # Retries
//!
//! No operation here retries. See [`retry`] for a wrapper that rebuilds the
//! source for each attempt.

pub mod retry;

use crate::config::Config;
use crate::content_type::{self, ContentMetadata};
use crate::crypto::{is_encryption_header, Encryptor};
use crate::error::{self, Error, IntegrityCheck, Result};
use crate::http::{HttpTransport, RequestBody, Transport, TransportRequest, TransportResponse};
use crate::metrics;
use crate::path;
use crate::response::{materialize, ObjectDescriptor};
use crate::source::{ContentSource, TextEncoding};
use crate::transfer::{self, IntegrityProbe, LengthChecked, TransferMode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;

/// Header carrying the client-generated request id
pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Header carrying the MD5 the service computed over the stored body
pub const COMPUTED_MD5: HeaderName = HeaderName::from_static("computed-md5");

const CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

/// Per-call upload options
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Explicit Content-Type, used verbatim
    pub content_type: Option<String>,
    /// Caller-declared length for sources of unknown length
    pub content_length: Option<u64>,
    /// Extra headers (e.g. `m-*` metadata). `m-encrypt-*` and
    /// `Content-MD5` are reserved for the client.
    pub headers: HeaderMap,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    /// Add a header value, keeping earlier values of the same name
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Explicit type from the option or a Content-Type header
    fn explicit_content_type(&self) -> Option<&str> {
        self.content_type
            .as_deref()
            .or_else(|| self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()))
    }

    /// Caller headers to send as-is. Content-Type and Content-Length are
    /// consumed by resolution; reserved names are rejected.
    fn forwarded_headers(&self) -> Result<HeaderMap> {
        let mut forwarded = HeaderMap::new();
        for (name, value) in self.headers.iter() {
            if name == CONTENT_TYPE || name == CONTENT_LENGTH {
                continue;
            }
            if name == CONTENT_MD5 || is_encryption_header(name) {
                return Err(Error::InvalidHeader(format!(
                    "{} is set by the client and cannot be supplied",
                    name
                )));
            }
            forwarded.append(name.clone(), value.clone());
        }
        Ok(forwarded)
    }

    /// Declared length from the option or a Content-Length header
    fn declared_length(&self) -> Result<Option<u64>> {
        if let Some(length) = self.content_length {
            return Ok(Some(length));
        }
        self.headers
            .get(CONTENT_LENGTH)
            .map(|v| {
                v.to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or_else(|| Error::InvalidHeader(format!("Content-Length: {:?}", v)))
            })
            .transpose()
    }
}

/// A downloaded object
#[derive(Debug, Clone)]
pub struct ObjectContent {
    pub descriptor: ObjectDescriptor,
    pub data: Bytes,
}

impl ObjectContent {
    /// Decode the body as text
    pub fn text(&self, encoding: TextEncoding) -> String {
        encoding.decode(&self.data)
    }
}

/// Client for uploading and reading objects
pub struct ObjectClient {
    transport: Arc<dyn Transport>,
    buffer_size: u64,
    default_charset: TextEncoding,
    checksum: bool,
    encryptor: Option<Encryptor>,
}

impl ObjectClient {
    /// Create a client on top of an existing transport
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let encryptor = Encryptor::from_config(&config.encryption)?;
        Self::build(config, transport, encryptor)
    }

    /// Create a client with a caller-built encryptor.
    ///
    /// The `encryption` section of `config` is ignored, which allows cipher
    /// constructions that are not registered by name.
    pub fn with_encryptor(
        config: &Config,
        transport: Arc<dyn Transport>,
        encryptor: Encryptor,
    ) -> Result<Self> {
        let mut config = config.clone();
        config.encryption = Default::default();
        config.validate()?;
        Self::build(&config, transport, Some(encryptor))
    }

    fn build(
        config: &Config,
        transport: Arc<dyn Transport>,
        encryptor: Option<Encryptor>,
    ) -> Result<Self> {
        if let Some(encryptor) = &encryptor {
            tracing::info!(
                key_id = %encryptor.key_id(),
                cipher = encryptor.construction().name(),
                "Client-side encryption enabled"
            );
        }

        Ok(Self {
            transport,
            buffer_size: config.upload.buffer_size,
            default_charset: config.default_charset(),
            checksum: config.upload.checksum,
            encryptor,
        })
    }

    /// Create a client with the reqwest transport
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.client)?;
        Self::new(config, Arc::new(transport))
    }

    /// Buffered upload threshold in bytes
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn default_charset(&self) -> TextEncoding {
        self.default_charset
    }

    pub fn is_encrypting(&self) -> bool {
        self.encryptor.is_some()
    }

    /// Upload text with the configured default charset
    pub async fn put_str(
        &self,
        path: &str,
        text: &str,
        options: PutOptions,
    ) -> Result<ObjectDescriptor> {
        self.put_str_with_encoding(path, text, self.default_charset, options)
            .await
    }

    /// Upload text with an explicit charset
    pub async fn put_str_with_encoding(
        &self,
        path: &str,
        text: &str,
        encoding: TextEncoding,
        options: PutOptions,
    ) -> Result<ObjectDescriptor> {
        self.put(path, ContentSource::text(text, encoding), options)
            .await
    }

    /// Upload a byte buffer
    pub async fn put_bytes(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        options: PutOptions,
    ) -> Result<ObjectDescriptor> {
        self.put(path, ContentSource::bytes(data), options).await
    }

    /// Upload a local file
    pub async fn put_file(
        &self,
        path: &str,
        local: impl AsRef<Path>,
        options: PutOptions,
    ) -> Result<ObjectDescriptor> {
        let source = ContentSource::file(local).await?;
        self.put(path, source, options).await
    }

    /// Upload from a single-pass reader
    pub async fn put_stream<R>(
        &self,
        path: &str,
        reader: R,
        options: PutOptions,
    ) -> Result<ObjectDescriptor>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.put(path, ContentSource::stream(reader), options).await
    }

    /// Upload `source` to `path` with exactly one request
    #[tracing::instrument(
        name = "objput.put",
        skip(self, source, options),
        fields(
            object.path = %path,
            source.kind = ?source.kind(),
            transfer.mode = tracing::field::Empty,
            upload.bytes = tracing::field::Empty,
            object.etag = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    pub async fn put(
        &self,
        path: &str,
        source: ContentSource,
        options: PutOptions,
    ) -> Result<ObjectDescriptor> {
        let started = Instant::now();
        let mut mode = None;
        let result = self.upload(path, source, options, &mut mode).await;
        let mode_label = mode.map(|m: TransferMode| m.as_str()).unwrap_or("none");

        match &result {
            Ok((descriptor, wire_bytes)) => {
                metrics::record_upload_success(mode_label, *wire_bytes);
                metrics::record_upload_duration(mode_label, started.elapsed().as_secs_f64());
                tracing::Span::current().record("object.etag", descriptor.etag.as_str());
                tracing::info!(
                    path = %descriptor.path,
                    mode = mode_label,
                    bytes = descriptor.content_length,
                    "Upload complete"
                );
            }
            Err(e) => {
                metrics::record_upload_failure(mode_label);
                metrics::record_error(e.kind());
            }
        }

        result.map(|(descriptor, _)| descriptor)
    }

    async fn upload(
        &self,
        path: &str,
        mut source: ContentSource,
        options: PutOptions,
        mode: &mut Option<TransferMode>,
    ) -> Result<(ObjectDescriptor, u64)> {
        let wire_path = path::encode(path)?;
        let metadata = content_type::resolve(options.explicit_content_type(), &source).await;

        let known = source.known_length();
        let declared = options.declared_length()?;
        let forwarded = options.forwarded_headers()?;
        let expected = match (known, declared) {
            (Some(known), Some(declared)) if known != declared => {
                return Err(Error::IntegrityMismatch(IntegrityCheck::Length {
                    expected: declared,
                    actual: known,
                }));
            }
            (known, declared) => known.or(declared),
        };

        let mut stream = source.open().await?;
        let mut probe: Option<IntegrityProbe> = None;
        if let Some(expected) = expected {
            let (checked, length_probe) = LengthChecked::new(stream, expected);
            stream = checked.boxed();
            probe = Some(length_probe);
        }

        // Plaintext byte count, for encrypted uploads of unknown length
        let plaintext_read = Arc::new(AtomicU64::new(0));
        if expected.is_none() && self.encryptor.is_some() {
            let counter = plaintext_read.clone();
            stream = stream
                .inspect(move |chunk| {
                    if let Ok(chunk) = chunk {
                        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    }
                })
                .boxed();
        }

        let mut headers = HeaderMap::new();
        let (stream, wire_length, wire_content_type) = match &self.encryptor {
            Some(encryptor) => {
                let encrypted = encryptor.encrypt(stream, expected, &metadata)?;
                headers.extend(encrypted.headers);
                (
                    encrypted.stream,
                    encrypted.context.cipher_length,
                    encrypted.context.marker_content_type.to_string(),
                )
            }
            None => (stream, expected, metadata.content_type().to_string()),
        };

        let plan = transfer::select(stream, wire_length, None, self.buffer_size)
            .await
            .map_err(|e| probed(e, probe.as_ref()))?;
        *mode = Some(plan.mode());

        let span = tracing::Span::current();
        span.record("transfer.mode", plan.mode().as_str());
        if let Some(length) = plan.declared_length() {
            span.record("upload.bytes", length);
        }
        tracing::debug!(
            mode = %plan.mode(),
            length = ?plan.declared_length(),
            encrypted = self.encryptor.is_some(),
            "Transfer plan selected"
        );

        headers.insert(CONTENT_TYPE, header_value(&wire_content_type)?);
        if let Some(length) = plan.declared_length() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        let checksum = match plan.buffered_bytes() {
            Some(data) if self.checksum => {
                let digest = STANDARD.encode(md5::compute(data).0);
                headers.insert(CONTENT_MD5, header_value(&digest)?);
                Some(digest)
            }
            _ => None,
        };
        headers.extend(forwarded);
        if !headers.contains_key(REQUEST_ID) {
            headers.insert(REQUEST_ID, request_id()?);
        }

        let wire_bytes = plan.declared_length();
        let response = self
            .transport
            .execute(TransportRequest {
                method: Method::PUT,
                path: wire_path.clone(),
                headers,
                body: plan.into_body(),
            })
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return Err(probe
                    .as_ref()
                    .and_then(IntegrityProbe::failure)
                    .map(Error::IntegrityMismatch)
                    .unwrap_or_else(|| Error::Transport(e)));
            }
        };
        if let Some(check) = probe.as_ref().and_then(IntegrityProbe::failure) {
            return Err(Error::IntegrityMismatch(check));
        }

        tracing::Span::current().record("http.status_code", response.status.as_u16());
        if !response.status.is_success() {
            return Err(error::map_response(
                response.status,
                &response.headers,
                &response.body,
            ));
        }

        if let (Some(sent), Some(computed)) = (
            checksum,
            response
                .headers
                .get(COMPUTED_MD5)
                .and_then(|v| v.to_str().ok()),
        ) {
            if sent != computed {
                return Err(Error::IntegrityMismatch(IntegrityCheck::Checksum {
                    expected: sent,
                    actual: computed.to_string(),
                }));
            }
        }

        let mut descriptor = materialize(&path::decode(&wire_path)?, &response.headers)?;
        let wire_bytes = wire_bytes.unwrap_or(descriptor.content_length);
        if self.encryptor.is_some() {
            descriptor.content_type = metadata.content_type().to_string();
            descriptor.content_length =
                expected.unwrap_or_else(|| plaintext_read.load(Ordering::Relaxed));
        }

        Ok((descriptor, wire_bytes))
    }

    /// Fetch an object's metadata.
    ///
    /// With encryption enabled the descriptor reports the plaintext content
    /// type and length.
    #[tracing::instrument(
        name = "objput.head",
        skip(self),
        fields(object.path = %path, http.status_code = tracing::field::Empty),
        err
    )]
    pub async fn head(&self, path: &str) -> Result<ObjectDescriptor> {
        let response = self.request(Method::HEAD, path).await?;
        let mut descriptor = materialize(path, &response.headers)?;

        if let Some(encryptor) = &self.encryptor {
            if let Some(object) = encryptor.inspect(&response.headers)? {
                descriptor.content_type = object.content_type;
                if let Some(length) = object.plaintext_length {
                    descriptor.content_length = length;
                }
            }
        }

        Ok(descriptor)
    }

    /// Download an object, decrypting it when encryption is enabled
    #[tracing::instrument(
        name = "objput.get",
        skip(self),
        fields(
            object.path = %path,
            download.bytes = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    pub async fn get(&self, path: &str) -> Result<ObjectContent> {
        let response = self.request(Method::GET, path).await?;
        let mut descriptor = materialize(path, &response.headers)?;

        if response.body.len() as u64 != descriptor.content_length {
            return Err(Error::IntegrityMismatch(IntegrityCheck::Length {
                expected: descriptor.content_length,
                actual: response.body.len() as u64,
            }));
        }

        let mut data = response.body;
        if let Some(encryptor) = &self.encryptor {
            if let Some(object) = encryptor.inspect(&response.headers)? {
                data = encryptor.decrypt(&object, &data)?;
                descriptor.content_type = object.content_type;
                descriptor.content_length = data.len() as u64;
            }
        }

        tracing::Span::current().record("download.bytes", data.len());
        Ok(ObjectContent { descriptor, data })
    }

    /// Download an object as text.
    ///
    /// Without an explicit encoding, the charset of the object's content type
    /// is used when recognized, else the configured default.
    pub async fn get_string(&self, path: &str, encoding: Option<TextEncoding>) -> Result<String> {
        let content = self.get(path).await?;
        let encoding = encoding.unwrap_or_else(|| {
            ContentMetadata::explicit(&content.descriptor.content_type)
                .charset()
                .and_then(|c| c.parse().ok())
                .unwrap_or(self.default_charset)
        });
        Ok(content.text(encoding))
    }

    /// Delete an object
    #[tracing::instrument(
        name = "objput.delete",
        skip(self),
        fields(object.path = %path, http.status_code = tracing::field::Empty),
        err
    )]
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.request(Method::DELETE, path).await?;
        tracing::info!(path = %path, "Object deleted");
        Ok(())
    }

    /// Send a bodiless request and map non-2xx responses
    async fn request(&self, method: Method, path: &str) -> Result<TransportResponse> {
        let operation = method.as_str().to_ascii_lowercase();
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID, request_id()?);

        let result = self
            .transport
            .execute(TransportRequest {
                method,
                path: path::encode(path)?,
                headers,
                body: RequestBody::Empty,
            })
            .await
            .map_err(Error::Transport)
            .and_then(|response| {
                tracing::Span::current().record("http.status_code", response.status.as_u16());
                if response.status.is_success() {
                    Ok(response)
                } else {
                    Err(error::map_response(
                        response.status,
                        &response.headers,
                        &response.body,
                    ))
                }
            });

        metrics::record_request(&operation, result.is_ok());
        if let Err(e) = &result {
            metrics::record_error(e.kind());
        }
        result
    }
}

impl std::fmt::Debug for ObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectClient")
            .field("buffer_size", &self.buffer_size)
            .field("default_charset", &self.default_charset)
            .field("checksum", &self.checksum)
            .field("encryptor", &self.encryptor)
            .finish()
    }
}

/// Prefer a recorded length failure over the error it caused
fn probed(error: Error, probe: Option<&IntegrityProbe>) -> Error {
    match probe.and_then(IntegrityProbe::failure) {
        Some(check) => Error::IntegrityMismatch(check),
        None => error,
    }
}

fn request_id() -> Result<HeaderValue> {
    header_value(&uuid::Uuid::new_v4().to_string())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader(format!("{}: {}", value, e)))
}
