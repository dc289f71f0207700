//! Metadata Framing Module
//!
//! Every stored blob starts with a single JSON line describing the value
//! that follows:
//!
//! ```text
//! {"type":"jsonish","ttl":60000,"createdAt":1700000000000}\n<encoded value>
//! ```
//!
//! The value runs to the end of the blob. Readers reconstruct the header
//! from arbitrarily chunked input and hand back a stream positioned at the
//! first value byte.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{stream, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};

use crate::cache::codec::TypeName;
use crate::cache::MAX_HEADER_LENGTH;
use crate::error::{CacheError, Result, StoreOp};
use crate::store::ByteStream;

const DELIMITER: u8 = b'\n';

// == Metadata ==
/// Header written ahead of every value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Encoding of the value bytes
    #[serde(rename = "type")]
    pub type_name: TypeName,
    /// Lifetime in milliseconds, `None` = never expires
    #[serde(default, deserialize_with = "deserialize_ttl")]
    pub ttl: Option<u64>,
    /// Creation timestamp (Unix milliseconds)
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

impl Metadata {
    /// Creates metadata stamped with the current time.
    pub fn new(type_name: TypeName, ttl: Option<Duration>) -> Self {
        Self {
            type_name,
            ttl: ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
            created_at: current_timestamp_ms(),
        }
    }

    /// Checks whether the entry is stale at `now` (Unix milliseconds).
    ///
    /// An entry expires once its age strictly exceeds the TTL.
    pub fn is_expired_at(&self, now: i64) -> bool {
        match self.ttl {
            Some(ttl) => i128::from(now) - i128::from(self.created_at) > i128::from(ttl),
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Serializes the header line, delimiter included.
    pub fn encode(&self) -> Result<Bytes> {
        let mut line = serde_json::to_vec(self)?;
        if line.contains(&DELIMITER) {
            return Err(CacheError::Encoding(
                "metadata header contains a newline".to_string(),
            ));
        }
        line.push(DELIMITER);
        Ok(Bytes::from(line))
    }
}

/// Accepts integer milliseconds; null, fractional or negative values
/// mean the entry never expires.
fn deserialize_ttl<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let ttl = Option::<f64>::deserialize(deserializer)?;
    Ok(ttl.filter(|ms| ms.is_finite() && *ms >= 0.0 && ms.fract() == 0.0)
        .map(|ms| ms as u64))
}

/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// == Header Decoder ==
/// Incremental header parser fed one chunk at a time.
#[derive(Debug)]
pub struct HeaderDecoder {
    key: String,
    buf: BytesMut,
}

impl HeaderDecoder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            buf: BytesMut::new(),
        }
    }

    /// Consumes a chunk.
    ///
    /// Returns the parsed header and the bytes of `chunk` that follow the
    /// delimiter once it has been seen, `None` while still inside the header.
    pub fn feed(&mut self, chunk: Bytes) -> Result<Option<(Metadata, Bytes)>> {
        match chunk.iter().position(|byte| *byte == DELIMITER) {
            Some(pos) => {
                self.buf.extend_from_slice(&chunk[..pos]);
                let metadata = self.parse()?;
                Ok(Some((metadata, chunk.slice(pos + 1..))))
            }
            None => {
                self.buf.extend_from_slice(&chunk);
                if self.buf.len() > MAX_HEADER_LENGTH {
                    return Err(CacheError::malformed(
                        &self.key,
                        format!("header exceeds {MAX_HEADER_LENGTH} bytes without a delimiter"),
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Error for a source that ended before the delimiter.
    pub fn finish(self) -> CacheError {
        let reason = if self.buf.is_empty() {
            "entry is empty".to_string()
        } else {
            format!("entry ended after {} header bytes without a delimiter", self.buf.len())
        };
        CacheError::malformed(self.key, reason)
    }

    fn parse(&self) -> Result<Metadata> {
        serde_json::from_slice(&self.buf)
            .map_err(|err| CacheError::malformed(&self.key, format!("invalid header: {err}")))
    }
}

// == Read Header ==
/// Reads the header off `source`.
///
/// Returns the metadata and a stream starting at the first value byte.
/// Errors from `source` before the delimiter are propagated.
pub async fn read_header(key: &str, mut source: ByteStream) -> Result<(Metadata, ByteStream)> {
    let mut decoder = HeaderDecoder::new(key);

    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|err| CacheError::from_io(err, key, StoreOp::Read))?;
        if let Some((metadata, rest)) = decoder.feed(chunk)? {
            let body: ByteStream = if rest.is_empty() {
                source
            } else {
                Box::pin(stream::once(async move { Ok(rest) }).chain(source))
            };
            return Ok((metadata, body));
        }
    }

    Err(decoder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::from_chunks;
    use futures::TryStreamExt;
    use std::io;

    fn header_line() -> &'static [u8] {
        br#"{"type":"buffer","ttl":null,"createdAt":1700000000000}"#
    }

    async fn body_of(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[test]
    fn test_encode_is_single_line() {
        let metadata = Metadata::new(TypeName::Structured, Some(Duration::from_millis(200)));
        let line = metadata.encode().unwrap();
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(line.last(), Some(&b'\n'));

        let parsed: Metadata = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed, metadata);
        assert_eq!(parsed.ttl, Some(200));
    }

    #[test]
    fn test_no_expiry_serializes_as_null() {
        let metadata = Metadata::new(TypeName::Binary, None);
        let json: serde_json::Value =
            serde_json::from_slice(&metadata.encode().unwrap()).unwrap();
        assert!(json["ttl"].is_null());
        assert_eq!(json["type"], "buffer");
    }

    #[test]
    fn test_expiry_boundary() {
        let metadata = Metadata {
            type_name: TypeName::Binary,
            ttl: Some(200),
            created_at: 1_000,
        };
        assert!(!metadata.is_expired_at(1_000));
        assert!(!metadata.is_expired_at(1_200));
        assert!(metadata.is_expired_at(1_201));
        // Clock skew: creation in the future is never stale.
        assert!(!metadata.is_expired_at(0));
    }

    #[test]
    fn test_never_expires() {
        let metadata = Metadata {
            type_name: TypeName::Binary,
            ttl: None,
            created_at: 0,
        };
        assert!(!metadata.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_fractional_ttl_means_no_expiry() {
        let parsed: Metadata =
            serde_json::from_str(r#"{"type":"jsonish","ttl":0.5,"createdAt":0}"#).unwrap();
        assert_eq!(parsed.ttl, None);

        let missing: Metadata = serde_json::from_str(r#"{"type":"jsonish","createdAt":0}"#).unwrap();
        assert_eq!(missing.ttl, None);
    }

    #[tokio::test]
    async fn test_delimiter_inside_chunk() {
        let mut blob = header_line().to_vec();
        blob.extend_from_slice(b"\nbody bytes");
        let source = from_chunks(vec![Ok(Bytes::from(blob))]);

        let (metadata, body) = read_header("k", source).await.unwrap();
        assert_eq!(metadata.type_name, TypeName::Binary);
        assert_eq!(body_of(body).await, b"body bytes");
    }

    #[tokio::test]
    async fn test_delimiter_at_chunk_boundary() {
        let mut head = header_line().to_vec();
        head.push(b'\n');
        let source = from_chunks(vec![
            Ok(Bytes::from(head)),
            Ok(Bytes::from_static(b"body")),
        ]);

        let (_, body) = read_header("k", source).await.unwrap();
        assert_eq!(body_of(body).await, b"body");
    }

    #[tokio::test]
    async fn test_header_spans_chunks() {
        let line = header_line();
        let (a, b) = line.split_at(10);
        let (b, c) = b.split_at(20);
        let mut tail = c.to_vec();
        tail.extend_from_slice(b"\nxy");
        let source = from_chunks(vec![
            Ok(Bytes::copy_from_slice(a)),
            Ok(Bytes::copy_from_slice(b)),
            Ok(Bytes::from(tail)),
            Ok(Bytes::from_static(b"z")),
        ]);

        let (metadata, body) = read_header("k", source).await.unwrap();
        assert_eq!(metadata.created_at, 1_700_000_000_000);
        assert_eq!(body_of(body).await, b"xyz");
    }

    #[tokio::test]
    async fn test_missing_delimiter_is_malformed() {
        let source = from_chunks(vec![Ok(Bytes::from_static(header_line()))]);
        let err = read_header("k", source).await.err().unwrap();
        assert!(matches!(err, CacheError::MalformedEntry { ref key, .. } if key == "k"));

        let empty = from_chunks(Vec::new());
        let err = read_header("k", empty).await.err().unwrap();
        assert!(matches!(err, CacheError::MalformedEntry { .. }));
    }

    #[tokio::test]
    async fn test_unparsable_header_is_malformed() {
        let source = from_chunks(vec![Ok(Bytes::from_static(b"not json\nbody"))]);
        let err = read_header("k", source).await.err().unwrap();
        assert!(matches!(err, CacheError::MalformedEntry { .. }));
    }

    #[tokio::test]
    async fn test_source_error_propagates() {
        let source = from_chunks(vec![
            Ok(Bytes::from_static(b"{\"type\"")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let err = read_header("k", source).await.err().unwrap();
        match err {
            CacheError::Adapter { op, source, .. } => {
                assert_eq!(op, StoreOp::Read);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_oversized_header_is_malformed() {
        let mut decoder = HeaderDecoder::new("k");
        let chunk = Bytes::from(vec![b'a'; MAX_HEADER_LENGTH + 1]);
        assert!(matches!(
            decoder.feed(chunk),
            Err(CacheError::MalformedEntry { .. })
        ));
    }
}
