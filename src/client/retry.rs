//! Upload retries
//!
//! A non-seekable source cannot be replayed, so retries never reuse one.
//! [`put_with_retry`] asks a factory for a fresh [`ContentSource`] on every
//! attempt (reopening a file, re-reading a buffer) and only retries
//! failures that may be transient: service errors and transport errors.

use super::{ObjectClient, PutOptions};
use crate::error::{Error, Result};
use crate::response::ObjectDescriptor;
use crate::source::ContentSource;
use std::future::Future;
use std::time::Duration;

/// Attempt limits and backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (doubling, capped)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Whether a failed upload may be attempted again
pub fn should_retry(error: &Error) -> bool {
    error.is_retryable() || matches!(error, Error::Transport(_))
}

/// Upload with retries, building a new source for each attempt
pub async fn put_with_retry<F, Fut>(
    client: &ObjectClient,
    path: &str,
    options: PutOptions,
    policy: &RetryPolicy,
    mut source: F,
) -> Result<ObjectDescriptor>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ContentSource>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = client.put(path, source().await?, options.clone()).await;
        match result {
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    path = %path,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Upload failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
