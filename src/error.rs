//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use std::fmt;
use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Store Operation ==
/// Blob store call that produced an adapter error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Exists,
    Read,
    Write,
    Commit,
    Remove,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::Exists => "exists",
            StoreOp::Read => "read",
            StoreOp::Write => "write",
            StoreOp::Commit => "commit",
            StoreOp::Remove => "remove",
        };
        f.write_str(name)
    }
}

// == Cache Error Enum ==
/// Unified error type for the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key absent, or present but its TTL elapsed (`expired == true`)
    #[error("Key {key} does not exist")]
    KeyNotExists { key: String, expired: bool },

    /// Header missing, truncated or unparsable
    #[error("Malformed entry for key {key}: {reason}")]
    MalformedEntry { key: String, reason: String },

    /// Value cannot be encoded or decoded for its type
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Failure reported by the underlying blob store
    #[error("Store error during {op} of {key}: {source}")]
    Adapter {
        key: String,
        op: StoreOp,
        #[source]
        source: io::Error,
    },

    /// A caller-supplied byte stream failed partway
    #[error("Producer stream failed: {0}")]
    Producer(#[source] io::Error),

    /// A caller-supplied compute function failed
    #[error("Compute function failed: {0}")]
    Compute(#[source] anyhow::Error),

    /// The write side of a streaming handle is closed or was never attached
    #[error("Stream for key {key} is closed")]
    Closed { key: String },

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request body larger than the configured limit
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
}

impl CacheError {
    pub fn not_exists(key: impl Into<String>) -> Self {
        CacheError::KeyNotExists {
            key: key.into(),
            expired: false,
        }
    }

    pub fn expired(key: impl Into<String>) -> Self {
        CacheError::KeyNotExists {
            key: key.into(),
            expired: true,
        }
    }

    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::MalformedEntry {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn adapter(key: impl Into<String>, op: StoreOp, source: io::Error) -> Self {
        CacheError::Adapter {
            key: key.into(),
            op,
            source,
        }
    }

    /// True for both ordinary and expiry-triggered misses.
    pub fn is_key_not_exists(&self) -> bool {
        matches!(self, CacheError::KeyNotExists { .. })
    }

    /// True only for a miss caused by lazy expiry.
    pub fn is_expired(&self) -> bool {
        matches!(self, CacheError::KeyNotExists { expired: true, .. })
    }

    /// Builds an equivalent error, for outcomes reported on two channels.
    ///
    /// Wrapped sources are reduced to their kind and message.
    pub(crate) fn replicate(&self) -> CacheError {
        match self {
            CacheError::KeyNotExists { key, expired } => CacheError::KeyNotExists {
                key: key.clone(),
                expired: *expired,
            },
            CacheError::MalformedEntry { key, reason } => CacheError::malformed(key, reason),
            CacheError::Encoding(msg) => CacheError::Encoding(msg.clone()),
            CacheError::Adapter { key, op, source } => {
                CacheError::adapter(key, *op, io::Error::new(source.kind(), source.to_string()))
            }
            CacheError::Producer(source) => {
                CacheError::Producer(io::Error::new(source.kind(), source.to_string()))
            }
            CacheError::Compute(err) => CacheError::Compute(anyhow::anyhow!("{err:#}")),
            CacheError::Closed { key } => CacheError::Closed { key: key.clone() },
            CacheError::InvalidRequest(msg) => CacheError::InvalidRequest(msg.clone()),
            CacheError::PayloadTooLarge { limit } => CacheError::PayloadTooLarge { limit: *limit },
        }
    }

    // == Stream Conversions ==
    /// Wraps the error so it can travel as a stream item.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            CacheError::KeyNotExists { .. } => io::ErrorKind::NotFound,
            CacheError::MalformedEntry { .. } | CacheError::Encoding(_) => {
                io::ErrorKind::InvalidData
            }
            CacheError::Adapter { source, .. } | CacheError::Producer(source) => source.kind(),
            CacheError::Closed { .. } => io::ErrorKind::BrokenPipe,
            CacheError::InvalidRequest(_) | CacheError::PayloadTooLarge { .. } => {
                io::ErrorKind::InvalidInput
            }
            CacheError::Compute(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Recovers a `CacheError` carried inside an `io::Error`.
    ///
    /// Plain I/O errors are wrapped as [`CacheError::Adapter`] with the
    /// given key and operation.
    pub fn from_io(err: io::Error, key: &str, op: StoreOp) -> Self {
        if err.get_ref().is_none() {
            return Self::adapter(key, op, err);
        }
        let kind = err.kind();
        match err.into_inner() {
            Some(inner) => match inner.downcast::<CacheError>() {
                Ok(cache_err) => *cache_err,
                Err(inner) => Self::adapter(key, op, io::Error::new(kind, inner)),
            },
            None => Self::adapter(key, op, io::Error::from(kind)),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Encoding(err.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::KeyNotExists { .. } => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) | CacheError::Encoding(_) => StatusCode::BAD_REQUEST,
            CacheError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CacheError::Producer(_) => StatusCode::BAD_GATEWAY,
            CacheError::MalformedEntry { .. }
            | CacheError::Adapter { .. }
            | CacheError::Compute(_)
            | CacheError::Closed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_not_exists_flags() {
        let miss = CacheError::not_exists("a");
        assert!(miss.is_key_not_exists());
        assert!(!miss.is_expired());

        let expired = CacheError::expired("a");
        assert!(expired.is_key_not_exists());
        assert!(expired.is_expired());
        assert_eq!(expired.to_string(), "Key a does not exist");
    }

    #[test]
    fn test_io_round_trip_keeps_variant() {
        let io_err = CacheError::expired("k").into_io();
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);

        match CacheError::from_io(io_err, "other", StoreOp::Read) {
            CacheError::KeyNotExists { key, expired } => {
                assert_eq!(key, "k");
                assert!(expired);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_io_wraps_plain_errors() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = CacheError::from_io(io_err, "k", StoreOp::Write);
        match err {
            CacheError::Adapter { key, op, source } => {
                assert_eq!(key, "k");
                assert_eq!(op, StoreOp::Write);
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
                assert_eq!(source.to_string(), "denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_replicate_keeps_kind_and_message() {
        let original = CacheError::adapter(
            "k",
            StoreOp::Commit,
            io::Error::new(io::ErrorKind::WriteZero, "disk full"),
        );
        match original.replicate() {
            CacheError::Adapter { key, op, source } => {
                assert_eq!(key, "k");
                assert_eq!(op, StoreOp::Commit);
                assert_eq!(source.kind(), io::ErrorKind::WriteZero);
                assert_eq!(source.to_string(), "disk full");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            CacheError::not_exists("k").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CacheError::malformed("k", "bad").into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            CacheError::InvalidRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CacheError::PayloadTooLarge { limit: 1 }.into_response().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
