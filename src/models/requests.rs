//! Request DTOs for the cache server API
//!
//! Defines the query parameters accepted by the cache endpoints.

use std::time::Duration;

use serde::Deserialize;

/// Query string for the SET operation (PUT /cache/:key)
///
/// # Fields
/// - `ttl`: Optional lifetime in (fractional) seconds; absent means the
///   entry never expires
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetQuery {
    /// Optional TTL in seconds
    #[serde(default)]
    pub ttl: Option<f64>,
}

impl SetQuery {
    /// Validates the query parameters
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        match self.ttl {
            Some(ttl) if ttl.is_nan() => Some("TTL must be a number".to_string()),
            Some(ttl) if ttl < 0.0 => Some("TTL cannot be negative".to_string()),
            _ => None,
        }
    }

    /// TTL as a duration; an infinite value means no expiry.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Validates a cache key taken from the request path
///
/// Returns an error message if validation fails, None if valid.
pub fn validate_key(key: &str) -> Option<String> {
    if key.is_empty() {
        return Some("Key cannot be empty".to_string());
    }
    if key.contains('\0') {
        return Some("Key cannot contain NUL bytes".to_string());
    }
    None
}
