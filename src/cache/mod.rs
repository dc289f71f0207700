//! Cache Module
//!
//! Blob-backed cache with typed values, lazy TTL expiry and streaming
//! read-through.

mod bridge;
mod codec;
mod engine;
mod metadata;


// Re-export public types
pub use bridge::CacheDuplex;
pub use codec::{CacheValue, TypeName};
pub use engine::{Cache, Entry, EntryWriter, GetOrSetOptions, SetOptions};
pub use metadata::{current_timestamp_ms, read_header, HeaderDecoder, Metadata};

// == Public Constants ==
/// Prefix prepended to every key before it reaches the blob store
pub const DEFAULT_KEY_PREFIX: &str = "cloud-cache/";

/// Chunks buffered between a streaming handle and its consumer
pub const DEFAULT_STREAM_BUFFER: usize = 16;

/// Longest metadata header accepted before the delimiter
pub const MAX_HEADER_LENGTH: usize = 64 * 1024;
