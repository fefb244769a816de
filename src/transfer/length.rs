//! Stream length verification
//!
//! [`LengthChecked`] passes chunks through untouched and fails the stream
//! as soon as it can tell that the byte count will not match: on the chunk
//! that overshoots, or at end of stream when it came up short. The failure
//! is also recorded in an [`IntegrityProbe`] so it can be recovered after an
//! HTTP client has wrapped the I/O error in its own error type.

use crate::error::IntegrityCheck;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

/// I/O error payload carrying the failed check
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct IntegrityError(pub IntegrityCheck);

/// Shared record of a length failure
#[derive(Debug, Clone, Default)]
pub struct IntegrityProbe {
    failure: Arc<Mutex<Option<IntegrityCheck>>>,
}

impl IntegrityProbe {
    /// The recorded failure, if any
    pub fn failure(&self) -> Option<IntegrityCheck> {
        self.failure.lock().clone()
    }

    fn record(&self, check: IntegrityCheck) {
        self.failure.lock().get_or_insert(check);
    }
}

/// Extract an integrity failure from an I/O error
pub fn integrity_failure(error: &io::Error) -> Option<IntegrityCheck> {
    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<IntegrityError>())
        .map(|e| e.0.clone())
}

pin_project! {
    /// Stream adapter that enforces an exact byte count
    pub struct LengthChecked<S> {
        #[pin]
        inner: S,
        expected: u64,
        seen: u64,
        finished: bool,
        probe: IntegrityProbe,
    }
}

impl<S> LengthChecked<S> {
    /// Wrap `inner`, expecting exactly `expected` bytes
    pub fn new(inner: S, expected: u64) -> (Self, IntegrityProbe) {
        let probe = IntegrityProbe::default();
        let checked = Self {
            inner,
            expected,
            seen: 0,
            finished: false,
            probe: probe.clone(),
        };
        (checked, probe)
    }
}

impl<S> Stream for LengthChecked<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }

        let check = match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.seen += chunk.len() as u64;
                if *this.seen <= *this.expected {
                    return Poll::Ready(Some(Ok(chunk)));
                }
                IntegrityCheck::Length {
                    expected: *this.expected,
                    actual: *this.seen,
                }
            }
            Some(Err(e)) => return Poll::Ready(Some(Err(e))),
            None if *this.seen == *this.expected => {
                *this.finished = true;
                return Poll::Ready(None);
            }
            None => IntegrityCheck::Length {
                expected: *this.expected,
                actual: *this.seen,
            },
        };

        *this.finished = true;
        this.probe.record(check.clone());
        Poll::Ready(Some(Err(io::Error::new(
            io::ErrorKind::InvalidData,
            IntegrityError(check),
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, StreamExt};

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_exact_length_passes() {
        let (checked, probe) = LengthChecked::new(chunks(&[b"abc", b"de"]), 5);
        let out: Vec<_> = checked.collect().await;

        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.is_ok()));
        assert!(probe.failure().is_none());
    }

    #[tokio::test]
    async fn test_short_stream_fails_at_end() {
        let (mut checked, probe) = LengthChecked::new(chunks(&[b"abc"]), 5);

        assert!(checked.next().await.unwrap().is_ok());
        let err = checked.next().await.unwrap().unwrap_err();
        assert_eq!(
            integrity_failure(&err),
            Some(IntegrityCheck::Length { expected: 5, actual: 3 })
        );
        assert!(checked.next().await.is_none());
        assert_eq!(
            probe.failure(),
            Some(IntegrityCheck::Length { expected: 5, actual: 3 })
        );
    }

    #[tokio::test]
    async fn test_long_stream_fails_on_overshoot() {
        let (mut checked, probe) = LengthChecked::new(chunks(&[b"abc", b"def", b"g"]), 4);

        assert!(checked.next().await.unwrap().is_ok());
        let err = checked.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(checked.next().await.is_none());
        assert_eq!(
            probe.failure(),
            Some(IntegrityCheck::Length { expected: 4, actual: 6 })
        );
    }

    #[test]
    fn test_unrelated_io_error() {
        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(integrity_failure(&err).is_none());
    }
}
