//! objput
//!
//! Upload pipeline of an object-storage client: takes text, byte buffers,
//! files or arbitrary streams, picks a transfer strategy, optionally
//! encrypts on the client, and returns the stored object's descriptor.
//!
//! # Features
//!
//! - **Adaptive transfer**: buffered uploads with an exact Content-Length up
//!   to a configured threshold, chunked streaming above it or when the
//!   length is unknown
//! - **Content-Type resolution**: explicit, charset-aware text, extension
//!   and magic-number detection, `application/octet-stream` fallback
//! - **Client-side encryption**: AES-256-GCM in 64 KiB segments, with the
//!   true content type hidden from readers without the key
//! - **Length integrity**: declared and actual lengths are checked end to end
//!
//! # Example
//!
//! ```no_run
//! use objput::{client::{ObjectClient, PutOptions}, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let client = ObjectClient::from_config(&config)?;
//!     let descriptor = client
//!         .put_file("/acct/stor/photo.jpg", "photo.jpg", PutOptions::default())
//!         .await?;
//!     println!("{} {}", descriptor.etag, descriptor.content_type);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod content_type;
pub mod crypto;
pub mod error;
pub mod http;
pub mod metrics;
pub mod path;
pub mod response;
pub mod source;
pub mod transfer;

// Re-export commonly used types
pub use client::{ObjectClient, ObjectContent, PutOptions};
pub use config::Config;
pub use error::{Error, Result};
pub use response::ObjectDescriptor;
pub use source::{ContentSource, TextEncoding};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
