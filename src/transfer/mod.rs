//! Transfer strategy selection
//!
//! Decides between a buffered single-shot request and a chunked streaming
//! request from the source's known length, an optional caller-declared
//! length and the configured buffer threshold `B`.
//!
//! | known | declared | outcome |
//! |-------|----------|---------|
//! | ≤ B | - | Buffered, exact length |
//! | > B | - | Chunked, known length sent |
//! | - | ≤ B | Buffered after confirming the size |
//! | - | > B | Chunked, declared length sent, no local buffering |
//! | - | - | probe `B + 1` bytes: Buffered if the stream ends, else Chunked without length |
//!
//! A known length and a declared length that disagree are rejected before
//! anything is read. Data is never truncated or padded to fit a length.

use crate::error::{Error, IntegrityCheck, Result};
use crate::http::RequestBody;
use crate::source::{ByteStream, READ_CHUNK_SIZE};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::io;

pub mod length;

pub use length::{integrity_failure, IntegrityProbe, LengthChecked};

/// How the body goes over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Buffered,
    Chunked,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Buffered => "buffered",
            TransferMode::Chunked => "chunked",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do before any byte is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Read exactly `expected` bytes into memory
    Buffer { expected: u64 },
    /// Stream the body, sending `length` when there is one
    Stream { length: Option<u64> },
    /// Nothing is known: read up to `B + 1` bytes and decide from that
    Probe,
}

/// Choose a strategy from lengths alone
pub fn decide(known: Option<u64>, declared: Option<u64>, threshold: u64) -> Result<Decision> {
    if let (Some(known), Some(declared)) = (known, declared) {
        if known != declared {
            return Err(Error::IntegrityMismatch(IntegrityCheck::Length {
                expected: declared,
                actual: known,
            }));
        }
    }

    Ok(match known.or(declared) {
        Some(length) if length <= threshold => Decision::Buffer { expected: length },
        Some(length) => Decision::Stream {
            length: Some(length),
        },
        None => Decision::Probe,
    })
}

enum PlanBody {
    Buffered(Bytes),
    Stream(ByteStream),
}

/// Outcome of strategy selection, carrying the body to send
pub struct TransferPlan {
    mode: TransferMode,
    declared_length: Option<u64>,
    body: PlanBody,
}

impl TransferPlan {
    fn buffered(data: Bytes) -> Self {
        Self {
            mode: TransferMode::Buffered,
            declared_length: Some(data.len() as u64),
            body: PlanBody::Buffered(data),
        }
    }

    fn chunked(stream: ByteStream, length: Option<u64>) -> Self {
        Self {
            mode: TransferMode::Chunked,
            declared_length: length,
            body: PlanBody::Stream(stream),
        }
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Value of the Content-Length header, if one is sent
    pub fn declared_length(&self) -> Option<u64> {
        self.declared_length
    }

    /// Materialized body of a buffered plan
    pub fn buffered_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            PlanBody::Buffered(data) => Some(data),
            PlanBody::Stream(_) => None,
        }
    }

    /// Hand the body to the transport
    pub fn into_body(self) -> RequestBody {
        match self.body {
            PlanBody::Buffered(data) => RequestBody::Bytes(data),
            PlanBody::Stream(stream) => RequestBody::Stream(stream),
        }
    }
}

impl fmt::Debug for TransferPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferPlan")
            .field("mode", &self.mode)
            .field("declared_length", &self.declared_length)
            .finish()
    }
}

/// Select a transfer plan for `stream`.
///
/// `known` and `declared` describe the bytes of `stream` itself (ciphertext
/// lengths when encryption is on).
pub async fn select(
    stream: ByteStream,
    known: Option<u64>,
    declared: Option<u64>,
    threshold: u64,
) -> Result<TransferPlan> {
    let decision = decide(known, declared, threshold)?;
    tracing::debug!(?decision, ?known, ?declared, threshold, "Transfer decision");

    match decision {
        Decision::Buffer { expected } => {
            let bounded = read_bounded(stream, expected.saturating_add(1)).await?;
            let actual = bounded.data.len() as u64;
            if actual != expected || !bounded.is_complete() {
                return Err(Error::IntegrityMismatch(IntegrityCheck::Length {
                    expected,
                    actual,
                }));
            }
            Ok(TransferPlan::buffered(bounded.data))
        }
        Decision::Stream { length } => Ok(TransferPlan::chunked(stream, length)),
        Decision::Probe => {
            let bounded = read_bounded(stream, threshold.saturating_add(1)).await?;
            match bounded.rest {
                None if bounded.data.len() as u64 <= threshold => {
                    Ok(TransferPlan::buffered(bounded.data))
                }
                rest => {
                    let prefix = stream::iter([Ok(bounded.data)]);
                    let body = match rest {
                        Some(rest) => prefix.chain(rest).boxed(),
                        None => prefix.boxed(),
                    };
                    Ok(TransferPlan::chunked(body, None))
                }
            }
        }
    }
}

/// Result of [`read_bounded`]
pub struct Bounded {
    /// Bytes read, at most the limit
    pub data: Bytes,
    /// The unread remainder, or `None` when the stream ended
    pub rest: Option<ByteStream>,
}

impl Bounded {
    /// Whether the stream ended within the limit
    pub fn is_complete(&self) -> bool {
        self.rest.is_none()
    }
}

/// Read at most `limit` bytes, returning the data and whatever remains.
///
/// A chunk straddling the limit is split and its tail put back in front of
/// the remainder.
pub async fn read_bounded(mut stream: ByteStream, limit: u64) -> Result<Bounded> {
    let capacity = limit.min(4 * READ_CHUNK_SIZE as u64) as usize;
    let mut buffer = BytesMut::with_capacity(capacity);

    while (buffer.len() as u64) < limit {
        let Some(chunk) = stream.next().await else {
            return Ok(Bounded {
                data: buffer.freeze(),
                rest: None,
            });
        };
        let mut chunk = chunk.map_err(stream_error)?;

        let room = (limit - buffer.len() as u64) as usize;
        if chunk.len() > room {
            let tail = chunk.split_off(room);
            buffer.extend_from_slice(&chunk);
            let rest = stream::iter([Ok(tail)]).chain(stream).boxed();
            return Ok(Bounded {
                data: buffer.freeze(),
                rest: Some(rest),
            });
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(Bounded {
        data: buffer.freeze(),
        rest: Some(stream),
    })
}

/// Convert a body stream failure, recovering integrity checks
pub fn stream_error(error: io::Error) -> Error {
    match integrity_failure(&error) {
        Some(check) => Error::IntegrityMismatch(check),
        None => Error::Io(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::collect;

    const B: u64 = 16;

    fn chunks(parts: Vec<Vec<u8>>) -> ByteStream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p)))).boxed()
    }

    fn bytes_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn body_of(plan: TransferPlan) -> Bytes {
        match plan.into_body() {
            RequestBody::Bytes(data) => data,
            RequestBody::Stream(stream) => collect(stream).await.unwrap(),
            RequestBody::Empty => Bytes::new(),
        }
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(decide(Some(B), None, B).unwrap(), Decision::Buffer { expected: B });
        assert_eq!(decide(Some(0), None, B).unwrap(), Decision::Buffer { expected: 0 });
        assert_eq!(
            decide(Some(B + 1), None, B).unwrap(),
            Decision::Stream { length: Some(B + 1) }
        );
        assert_eq!(decide(None, Some(B), B).unwrap(), Decision::Buffer { expected: B });
        assert_eq!(
            decide(None, Some(B + 1), B).unwrap(),
            Decision::Stream { length: Some(B + 1) }
        );
        assert_eq!(decide(None, None, B).unwrap(), Decision::Probe);
        assert_eq!(decide(Some(5), Some(5), B).unwrap(), Decision::Buffer { expected: 5 });
    }

    #[test]
    fn test_conflicting_lengths_rejected() {
        let err = decide(Some(10), Some(12), B).unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityMismatch(IntegrityCheck::Length { expected: 12, actual: 10 })
        ));
    }

    #[tokio::test]
    async fn test_known_below_threshold_is_buffered() {
        let data = bytes_of(B as usize - 1);
        let plan = select(chunks(vec![data.clone()]), Some(B - 1), None, B)
            .await
            .unwrap();

        assert_eq!(plan.mode(), TransferMode::Buffered);
        assert_eq!(plan.declared_length(), Some(B - 1));
        assert_eq!(plan.buffered_bytes().map(|b| b.len()), Some(B as usize - 1));
        assert_eq!(&body_of(plan).await[..], &data[..]);
    }

    #[tokio::test]
    async fn test_known_above_threshold_streams_with_length() {
        let data = bytes_of(B as usize + 1);
        let plan = select(chunks(vec![data.clone()]), Some(B + 1), None, B)
            .await
            .unwrap();

        assert_eq!(plan.mode(), TransferMode::Chunked);
        assert_eq!(plan.declared_length(), Some(B + 1));
        assert!(plan.buffered_bytes().is_none());
        assert_eq!(&body_of(plan).await[..], &data[..]);
    }

    #[tokio::test]
    async fn test_unknown_short_stream_is_buffered() {
        let plan = select(chunks(vec![vec![1, 2], vec![3]]), None, None, B)
            .await
            .unwrap();
        assert_eq!(plan.mode(), TransferMode::Buffered);
        assert_eq!(plan.declared_length(), Some(3));
    }

    #[tokio::test]
    async fn test_unknown_stream_exactly_threshold_is_buffered() {
        let plan = select(chunks(vec![bytes_of(B as usize)]), None, None, B)
            .await
            .unwrap();
        assert_eq!(plan.mode(), TransferMode::Buffered);
        assert_eq!(plan.declared_length(), Some(B));
    }

    #[tokio::test]
    async fn test_unknown_long_stream_is_chunked_without_length() {
        let data = bytes_of(B as usize + 1);
        let parts = vec![data[..5].to_vec(), data[5..].to_vec()];
        let plan = select(chunks(parts), None, None, B).await.unwrap();

        assert_eq!(plan.mode(), TransferMode::Chunked);
        assert_eq!(plan.declared_length(), None);
        assert_eq!(&body_of(plan).await[..], &data[..]);
    }

    #[tokio::test]
    async fn test_declared_small_length_confirmed() {
        let plan = select(chunks(vec![bytes_of(8)]), None, Some(8), B)
            .await
            .unwrap();
        assert_eq!(plan.mode(), TransferMode::Buffered);
        assert_eq!(plan.declared_length(), Some(8));
    }

    #[tokio::test]
    async fn test_declared_small_length_short_stream() {
        let err = select(chunks(vec![bytes_of(6)]), None, Some(8), B)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityMismatch(IntegrityCheck::Length { expected: 8, actual: 6 })
        ));
    }

    #[tokio::test]
    async fn test_declared_small_length_long_stream() {
        let err = select(chunks(vec![bytes_of(12)]), None, Some(8), B)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityMismatch(IntegrityCheck::Length { expected: 8, .. })
        ));
    }

    #[tokio::test]
    async fn test_declared_large_length_not_buffered() {
        let plan = select(chunks(vec![bytes_of(40)]), None, Some(40), B)
            .await
            .unwrap();
        assert_eq!(plan.mode(), TransferMode::Chunked);
        assert_eq!(plan.declared_length(), Some(40));
    }

    #[tokio::test]
    async fn test_read_bounded_splits_straddling_chunk() {
        let bounded = read_bounded(chunks(vec![vec![1, 2, 3], vec![4, 5, 6]]), 4)
            .await
            .unwrap();
        assert_eq!(&bounded.data[..], &[1, 2, 3, 4]);
        assert!(!bounded.is_complete());

        let rest = collect(bounded.rest.unwrap()).await.unwrap();
        assert_eq!(&rest[..], &[5, 6]);
    }

    #[tokio::test]
    async fn test_read_bounded_zero_limit() {
        let bounded = read_bounded(chunks(vec![vec![1]]), 0).await.unwrap();
        assert!(bounded.data.is_empty());
        assert!(bounded.rest.is_some());
    }

    #[tokio::test]
    async fn test_length_checked_failure_surfaces_as_integrity() {
        let (checked, _probe) = LengthChecked::new(chunks(vec![bytes_of(3)]), 5);
        let err = select(checked.boxed(), None, None, B).await.unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityMismatch(IntegrityCheck::Length { expected: 5, actual: 3 })
        ));
    }
}
