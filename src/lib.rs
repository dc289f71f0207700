//! Cloud Cache - a key-value cache over pluggable blob storage
//!
//! Values are stored as blobs framed by a one-line JSON header, expire
//! lazily on read, and can be written and read as byte streams.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod store;

pub use api::AppState;
pub use cache::{Cache, CacheDuplex, CacheValue, GetOrSetOptions, SetOptions};
pub use config::{CacheConfig, Config};
pub use error::{CacheError, Result};
pub use store::{BlobStore, ByteStream, FsBlobStore, MemoryBlobStore};
