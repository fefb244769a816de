//! Configuration module for objput
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.
//!
//! ```yaml
//! client:
//!   endpoint: https://objects.example.com
//!   timeout_seconds: 30
//!   headers:
//!     authorization: ${OBJPUT_AUTH}
//! upload:
//!   buffer_size: 16384
//!   default_charset: UTF-8
//! encryption:
//!   enabled: true
//!   key: ${OBJPUT_KEY}
//! ```

use crate::crypto::SecretKey;
use crate::source::TextEncoding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
pub(crate) fn expand_env_vars(s: &str) -> String {
    // ${VAR} or ${VAR:-default}
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

    re.replace_all(s, |caps: &regex_lite::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => caps[0].to_string(),
            },
        }
    })
    .into_owned()
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.client.endpoint) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid endpoint '{}': must start with http:// or https://",
                self.client.endpoint
            )));
        }

        if self.client.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "timeout_seconds must be greater than 0".into(),
            ));
        }

        if self.upload.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "buffer_size must be greater than 0".into(),
            ));
        }

        if let Err(e) = self.upload.default_charset.parse::<TextEncoding>() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid default_charset: {}",
                e
            )));
        }

        if self.encryption.enabled {
            // Validate key material
            match self.encryption.key.as_deref() {
                None => {
                    return Err(ConfigError::ValidationError(
                        "Encryption is enabled but no key is configured".into(),
                    ))
                }
                Some(key) => {
                    if let Err(e) = SecretKey::from_base64(key) {
                        return Err(ConfigError::ValidationError(format!(
                            "Invalid encryption key: {}",
                            e
                        )));
                    }
                }
            }

            if let Some(key_id) = &self.encryption.key_id {
                if key_id.trim().is_empty() {
                    return Err(ConfigError::ValidationError(
                        "key_id cannot be empty when set".into(),
                    ));
                }
            }

            if crate::crypto::construction(&self.encryption.cipher).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Unsupported cipher '{}': must be 'AES256/GCM-STREAM'",
                    self.encryption.cipher
                )));
            }
        }

        Ok(())
    }

    /// Charset used for text when the caller names none.
    ///
    /// UTF-8 for a charset that [`validate`](Self::validate) rejects.
    pub fn default_charset(&self) -> TextEncoding {
        self.upload.default_charset.parse().unwrap_or(TextEncoding::Utf8)
    }
}

/// Remote service connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub endpoint: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".into(),
            timeout_seconds: default_timeout_seconds(),
            user_agent: default_user_agent(),
            headers: BTreeMap::new(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("objput/{}", crate::VERSION)
}

/// Upload behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Largest body sent buffered with an exact Content-Length
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u64,
    #[serde(default = "default_charset")]
    pub default_charset: String,
    /// Send Content-MD5 on buffered uploads
    #[serde(default = "default_checksum")]
    pub checksum: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            default_charset: default_charset(),
            checksum: default_checksum(),
        }
    }
}

fn default_buffer_size() -> u64 {
    16384 // 16KB
}

fn default_charset() -> String {
    "UTF-8".into()
}

fn default_checksum() -> bool {
    true
}

/// Client-side encryption settings
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Defaults to a fingerprint of the key
    #[serde(default)]
    pub key_id: Option<String>,
    /// Base64-encoded 256-bit key
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_cipher")]
    pub cipher: String,
    #[serde(default)]
    pub permit_unencrypted_downloads: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_id: None,
            key: None,
            cipher: default_cipher(),
            permit_unencrypted_downloads: false,
        }
    }
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enabled", &self.enabled)
            .field("key_id", &self.key_id)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("cipher", &self.cipher)
            .field(
                "permit_unencrypted_downloads",
                &self.permit_unencrypted_downloads,
            )
            .finish()
    }
}

fn default_cipher() -> String {
    "AES256/GCM-STREAM".into()
}
