//! Configuration Module
//!
//! Cache construction options and server configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use crate::cache::{DEFAULT_KEY_PREFIX, DEFAULT_STREAM_BUFFER};

/// Largest JSON request body the server buffers, in bytes
pub const DEFAULT_MAX_JSON_BODY: usize = 2 * 1024 * 1024;

// == Cache Config ==
/// Options accepted when constructing a [`Cache`](crate::cache::Cache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Namespace prepended to every key before it reaches the store
    pub key_prefix: String,
    /// Queue depth (in chunks) of each side of a streaming handle
    pub stream_buffer: usize,
}

impl CacheConfig {
    pub fn with_prefix(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            ..Self::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

// == Server Config ==
/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Key namespace used by the cache
    pub key_prefix: String,
    /// HTTP server port
    pub server_port: u16,
    /// Root directory of the filesystem blob store
    pub store_dir: PathBuf,
    /// Queue depth of streaming handles, in chunks
    pub stream_buffer: usize,
    /// Size limit for JSON bodies, which are buffered before parsing
    pub max_json_body: usize,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `KEY_PREFIX` - Key namespace (default: `cloud-cache/`)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `STORE_DIR` - Blob store directory (default: `./.cloud-cache`)
    /// - `STREAM_BUFFER` - Streaming queue depth in chunks (default: 16)
    /// - `MAX_JSON_BODY` - JSON body limit in bytes (default: 2 MiB)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            key_prefix: env::var("KEY_PREFIX").unwrap_or(defaults.key_prefix),
            server_port: env::var("SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.server_port),
            store_dir: env::var("STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_dir),
            stream_buffer: env::var("STREAM_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.stream_buffer),
            max_json_body: env::var("MAX_JSON_BODY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_json_body),
        }
    }

    /// Cache options derived from this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            key_prefix: self.key_prefix.clone(),
            stream_buffer: self.stream_buffer,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            server_port: 3000,
            store_dir: PathBuf::from("./.cloud-cache"),
            stream_buffer: DEFAULT_STREAM_BUFFER,
            max_json_body: DEFAULT_MAX_JSON_BODY,
        }
    }
}
