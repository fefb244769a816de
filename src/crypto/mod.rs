//! Client-side encryption overlay
//!
//! When enabled, the plaintext stream is replaced by ciphertext before the
//! transfer strategy is chosen. The request's Content-Type becomes the
//! marker type `application/octet-stream`; the true content type travels
//! only inside the sealed `m-encrypt-metadata` header, and the plaintext
//! length only in `m-encrypt-plaintext-content-length`.
//!
//! The cipher itself is pluggable through [`CipherConstruction`]. A
//! construction that cannot project the ciphertext length from the
//! plaintext length makes every encrypted upload chunked without a length.
//!
//! # Headers
//!
//! | header | value |
//! |--------|-------|
//! | `m-encrypt-type` | `client/1` |
//! | `m-encrypt-key-id` | key identifier |
//! | `m-encrypt-cipher` | construction name |
//! | `m-encrypt-iv` | base64 stream IV |
//! | `m-encrypt-plaintext-content-length` | plaintext bytes, when known |
//! | `m-encrypt-metadata` | base64 sealed JSON |

pub mod gcm_stream;

pub use gcm_stream::GcmStream;

use crate::config::EncryptionConfig;
use crate::content_type::{ContentMetadata, OCTET_STREAM};
use crate::error::{Error, Result};
use crate::source::ByteStream;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

pub const ENCRYPT_TYPE: HeaderName = HeaderName::from_static("m-encrypt-type");
pub const ENCRYPT_KEY_ID: HeaderName = HeaderName::from_static("m-encrypt-key-id");
pub const ENCRYPT_CIPHER: HeaderName = HeaderName::from_static("m-encrypt-cipher");
pub const ENCRYPT_IV: HeaderName = HeaderName::from_static("m-encrypt-iv");
pub const ENCRYPT_PLAINTEXT_LENGTH: HeaderName =
    HeaderName::from_static("m-encrypt-plaintext-content-length");
pub const ENCRYPT_METADATA: HeaderName = HeaderName::from_static("m-encrypt-metadata");

/// Prefix shared by all encryption headers
pub const ENCRYPT_HEADER_PREFIX: &str = "m-encrypt-";

/// Value of `m-encrypt-type`
pub const ENCRYPT_TYPE_VALUE: &str = "client/1";

/// AES-256 key material. Never printed.
#[derive(Clone)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key, which must be exactly 32 bytes
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Encryption(format!("Key is not valid base64: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::Encryption(format!("Key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Identifier derived from the key: first 16 hex digits of its SHA-256
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Ciphertext stream plus the IV needed to decrypt it
pub struct EncryptedStream {
    pub iv: Vec<u8>,
    pub stream: ByteStream,
}

/// A cipher construction usable by the overlay
pub trait CipherConstruction: Send + Sync {
    /// Name sent in `m-encrypt-cipher`
    fn name(&self) -> &'static str;

    /// Ciphertext length for a plaintext length, if the construction can
    /// tell in advance
    fn ciphertext_length(&self, plaintext: u64) -> Option<u64>;

    /// Inverse of [`ciphertext_length`](Self::ciphertext_length)
    fn plaintext_length(&self, ciphertext: u64) -> Option<u64>;

    /// Encrypt a small value in one shot (nonce included in the output)
    fn seal(&self, key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Reverse [`seal`](Self::seal)
    fn open(&self, key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>>;

    /// Encrypt a stream with a fresh IV
    fn encrypt_stream(&self, key: &SecretKey, plaintext: ByteStream) -> EncryptedStream;

    /// Decrypt and authenticate a whole object body
    fn decrypt(&self, key: &SecretKey, iv: &[u8], ciphertext: &[u8]) -> Result<Bytes>;
}

/// Look up a construction by its `m-encrypt-cipher` name
pub fn construction(name: &str) -> Option<Arc<dyn CipherConstruction>> {
    if name.eq_ignore_ascii_case(gcm_stream::NAME) {
        Some(Arc::new(GcmStream))
    } else {
        None
    }
}

/// Lengths and content type seen on the wire for an encrypted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    /// Ciphertext bytes, when projectable
    pub cipher_length: Option<u64>,
    /// Plaintext bytes, when known before sending
    pub plaintext_length: Option<u64>,
    /// Content-Type sent instead of the real one
    pub marker_content_type: &'static str,
}

/// Ciphertext ready for transfer selection
pub struct EncryptedUpload {
    pub stream: ByteStream,
    pub context: EncryptionContext,
    /// `m-encrypt-*` headers to send
    pub headers: HeaderMap,
}

/// Decryption parameters recovered from an object's headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedObject {
    pub iv: Vec<u8>,
    /// Plaintext content type from the sealed metadata
    pub content_type: String,
    /// Plaintext length from the header, or projected from Content-Length
    pub plaintext_length: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedMetadata {
    content_type: String,
}

/// Encrypts uploads and decrypts downloads with one key
pub struct Encryptor {
    key_id: String,
    key: SecretKey,
    construction: Arc<dyn CipherConstruction>,
    permit_unencrypted_downloads: bool,
}

impl Encryptor {
    pub fn new(
        key_id: impl Into<String>,
        key: SecretKey,
        construction: Arc<dyn CipherConstruction>,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            key,
            construction,
            permit_unencrypted_downloads: false,
        }
    }

    /// Build from configuration. `None` when encryption is disabled.
    pub fn from_config(config: &EncryptionConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }

        let encoded = config
            .key
            .as_deref()
            .ok_or_else(|| Error::Encryption("Encryption is enabled but no key is set".into()))?;
        let key = SecretKey::from_base64(encoded)?;
        let construction = construction(&config.cipher)
            .ok_or_else(|| Error::Encryption(format!("Unsupported cipher: {}", config.cipher)))?;
        let key_id = config
            .key_id
            .clone()
            .unwrap_or_else(|| key.fingerprint());

        Ok(Some(
            Self::new(key_id, key, construction)
                .permit_unencrypted_downloads(config.permit_unencrypted_downloads),
        ))
    }

    /// Allow reading objects that carry no encryption headers
    pub fn permit_unencrypted_downloads(mut self, permit: bool) -> Self {
        self.permit_unencrypted_downloads = permit;
        self
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn construction(&self) -> &dyn CipherConstruction {
        self.construction.as_ref()
    }

    /// Wrap a plaintext stream for upload
    pub fn encrypt(
        &self,
        plaintext: ByteStream,
        plaintext_length: Option<u64>,
        metadata: &ContentMetadata,
    ) -> Result<EncryptedUpload> {
        let sealed = self.construction.seal(
            &self.key,
            &serde_json::to_vec(&SealedMetadata {
                content_type: metadata.content_type().to_string(),
            })
            .map_err(|e| Error::Encryption(format!("Metadata serialization failed: {}", e)))?,
        )?;

        let encrypted = self.construction.encrypt_stream(&self.key, plaintext);
        let context = EncryptionContext {
            cipher_length: plaintext_length.and_then(|l| self.construction.ciphertext_length(l)),
            plaintext_length,
            marker_content_type: OCTET_STREAM,
        };

        let mut headers = HeaderMap::new();
        headers.insert(ENCRYPT_TYPE, HeaderValue::from_static(ENCRYPT_TYPE_VALUE));
        headers.insert(ENCRYPT_KEY_ID, header_value(&self.key_id)?);
        headers.insert(
            ENCRYPT_CIPHER,
            HeaderValue::from_static(self.construction.name()),
        );
        headers.insert(ENCRYPT_IV, header_value(&STANDARD.encode(&encrypted.iv))?);
        if let Some(length) = plaintext_length {
            headers.insert(ENCRYPT_PLAINTEXT_LENGTH, HeaderValue::from(length));
        }
        headers.insert(ENCRYPT_METADATA, header_value(&STANDARD.encode(sealed))?);

        Ok(EncryptedUpload {
            stream: encrypted.stream,
            context,
            headers,
        })
    }

    /// Recover decryption parameters from response headers.
    ///
    /// `Ok(None)` means the object is not encrypted and unencrypted
    /// downloads are permitted.
    pub fn inspect(&self, headers: &HeaderMap) -> Result<Option<EncryptedObject>> {
        let Some(kind) = header_str(headers, &ENCRYPT_TYPE) else {
            if self.permit_unencrypted_downloads {
                return Ok(None);
            }
            return Err(Error::Encryption(
                "Object is not encrypted and unencrypted downloads are not permitted".into(),
            ));
        };
        if kind != ENCRYPT_TYPE_VALUE {
            return Err(Error::Encryption(format!("Unsupported encryption type: {}", kind)));
        }

        let key_id = required(headers, &ENCRYPT_KEY_ID)?;
        if key_id != self.key_id {
            return Err(Error::Encryption(format!(
                "Object was encrypted with key '{}', client has '{}'",
                key_id, self.key_id
            )));
        }

        let cipher = required(headers, &ENCRYPT_CIPHER)?;
        if !cipher.eq_ignore_ascii_case(self.construction.name()) {
            return Err(Error::Encryption(format!("Unsupported cipher: {}", cipher)));
        }

        let iv = decode_base64(required(headers, &ENCRYPT_IV)?, "IV")?;
        let sealed = decode_base64(required(headers, &ENCRYPT_METADATA)?, "metadata")?;
        let opened = self.construction.open(&self.key, &sealed)?;
        let metadata: SealedMetadata = serde_json::from_slice(&opened)
            .map_err(|e| Error::Encryption(format!("Metadata is not valid: {}", e)))?;

        let plaintext_length = header_str(headers, &ENCRYPT_PLAINTEXT_LENGTH)
            .and_then(|v| v.parse().ok())
            .or_else(|| {
                header_str(headers, &CONTENT_LENGTH)
                    .and_then(|v| v.parse().ok())
                    .and_then(|l| self.construction.plaintext_length(l))
            });

        Ok(Some(EncryptedObject {
            iv,
            content_type: metadata.content_type,
            plaintext_length,
        }))
    }

    /// Decrypt a downloaded body
    pub fn decrypt(&self, object: &EncryptedObject, ciphertext: &[u8]) -> Result<Bytes> {
        let plaintext = self
            .construction
            .decrypt(&self.key, &object.iv, ciphertext)?;
        if let Some(expected) = object.plaintext_length {
            if plaintext.len() as u64 != expected {
                return Err(Error::Encryption(format!(
                    "Decrypted {} bytes, metadata says {}",
                    plaintext.len(),
                    expected
                )));
            }
        }
        Ok(plaintext)
    }
}

impl fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryptor")
            .field("key_id", &self.key_id)
            .field("cipher", &self.construction.name())
            .field(
                "permit_unencrypted_downloads",
                &self.permit_unencrypted_downloads,
            )
            .finish()
    }
}

/// Whether a header belongs to the encryption overlay
pub fn is_encryption_header(name: &HeaderName) -> bool {
    name.as_str().starts_with(ENCRYPT_HEADER_PREFIX)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader(format!("{}: {}", value, e)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn required<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<&'a str> {
    header_str(headers, name)
        .ok_or_else(|| Error::Encryption(format!("Missing header {}", name)))
}

fn decode_base64(value: &str, what: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::Encryption(format!("Invalid {} encoding: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::collect;
    use futures::stream::{self, StreamExt};

    fn encryptor() -> Encryptor {
        Encryptor::new("test-key", SecretKey::new([1u8; 32]), Arc::new(GcmStream))
    }

    fn plaintext(data: &'static [u8]) -> ByteStream {
        stream::iter([Ok(Bytes::from_static(data))]).boxed()
    }

    /// Response headers a server would return for an encrypted upload
    fn stored_headers(upload: &EncryptedUpload, stored_length: usize) -> HeaderMap {
        let mut headers = upload.headers.clone();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(stored_length));
        headers
    }

    #[test]
    fn test_key_from_base64() {
        let key = SecretKey::from_base64(&STANDARD.encode([9u8; 32])).unwrap();
        assert_eq!(key.as_bytes(), &[9u8; 32]);
        assert_eq!(key.fingerprint().len(), 16);

        assert!(SecretKey::from_base64(&STANDARD.encode([9u8; 16])).is_err());
        assert!(SecretKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        assert_eq!(format!("{:?}", SecretKey::new([1u8; 32])), "SecretKey(..)");
    }

    #[test]
    fn test_construction_lookup() {
        assert!(construction("AES256/GCM-STREAM").is_some());
        assert!(construction("aes256/gcm-stream").is_some());
        assert!(construction("AES128/CTR").is_none());
    }

    #[tokio::test]
    async fn test_encrypt_headers_and_context() {
        let enc = encryptor();
        let meta = ContentMetadata::text("UTF-8");
        let upload = enc.encrypt(plaintext(b"secret"), Some(6), &meta).unwrap();

        assert_eq!(upload.context.marker_content_type, OCTET_STREAM);
        assert_eq!(upload.context.plaintext_length, Some(6));
        assert_eq!(upload.context.cipher_length, Some(22));
        assert_eq!(upload.headers[&ENCRYPT_TYPE], "client/1");
        assert_eq!(upload.headers[&ENCRYPT_KEY_ID], "test-key");
        assert_eq!(upload.headers[&ENCRYPT_CIPHER], "AES256/GCM-STREAM");
        assert_eq!(upload.headers[&ENCRYPT_PLAINTEXT_LENGTH], "6");

        // the true content type is never sent in the clear
        for value in upload.headers.values() {
            assert!(!value.to_str().unwrap().contains("text/plain"));
        }
    }

    #[tokio::test]
    async fn test_unknown_length_has_no_cipher_length() {
        let upload = encryptor()
            .encrypt(plaintext(b"secret"), None, &ContentMetadata::default())
            .unwrap();
        assert_eq!(upload.context.cipher_length, None);
        assert!(!upload.headers.contains_key(&ENCRYPT_PLAINTEXT_LENGTH));
    }

    #[tokio::test]
    async fn test_inspect_and_decrypt_round_trip() {
        let enc = encryptor();
        let meta = ContentMetadata::new("image/jpeg");
        let upload = enc.encrypt(plaintext(b"pixels"), None, &meta).unwrap();
        let headers = upload.headers.clone();
        let ciphertext = collect(upload.stream).await.unwrap();

        let mut stored = headers;
        stored.insert(CONTENT_LENGTH, HeaderValue::from(ciphertext.len()));

        let object = enc.inspect(&stored).unwrap().unwrap();
        assert_eq!(object.content_type, "image/jpeg");
        assert_eq!(object.plaintext_length, Some(6));

        let plain = enc.decrypt(&object, &ciphertext).unwrap();
        assert_eq!(&plain[..], b"pixels");
    }

    #[tokio::test]
    async fn test_key_id_mismatch() {
        let upload = encryptor()
            .encrypt(plaintext(b"x"), Some(1), &ContentMetadata::default())
            .unwrap();
        let other = Encryptor::new("other-key", SecretKey::new([1u8; 32]), Arc::new(GcmStream));

        let err = other.inspect(&stored_headers(&upload, 17)).unwrap_err();
        assert!(matches!(err, Error::Encryption(msg) if msg.contains("test-key")));
    }

    #[test]
    fn test_unencrypted_object_policy() {
        let headers = HeaderMap::new();
        assert!(matches!(
            encryptor().inspect(&headers),
            Err(Error::Encryption(_))
        ));
        assert_eq!(
            encryptor()
                .permit_unencrypted_downloads(true)
                .inspect(&headers)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_from_config() {
        let disabled = EncryptionConfig::default();
        assert!(Encryptor::from_config(&disabled).unwrap().is_none());

        let config = EncryptionConfig {
            enabled: true,
            key: Some(STANDARD.encode([3u8; 32])),
            ..EncryptionConfig::default()
        };
        let enc = Encryptor::from_config(&config).unwrap().unwrap();
        assert_eq!(enc.key_id(), SecretKey::new([3u8; 32]).fingerprint());
        assert_eq!(enc.construction().name(), "AES256/GCM-STREAM");

        let missing_key = EncryptionConfig {
            enabled: true,
            ..EncryptionConfig::default()
        };
        assert!(Encryptor::from_config(&missing_key).is_err());
    }

    #[test]
    fn test_encryption_header_prefix() {
        assert!(is_encryption_header(&ENCRYPT_IV));
        assert!(!is_encryption_header(&HeaderName::from_static("m-color")));
    }
}
