//! Blob Store Module
//!
//! The boundary contract the cache is written against: an opaque key to
//! byte-stream store with existence checks, streaming reads and writes,
//! and removal. Two reference adapters are provided.

mod fs;
mod memory;

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Stream};

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Chunked byte source used for every streaming read and producer.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Write destination for a single key.
pub type BlobWriter = Box<dyn BlobSink>;

// == Blob Sink ==
/// Byte sink returned by [`BlobStore::open_write`].
///
/// Every sink ends in exactly one of `commit` or `abort`. `commit` is the
/// completion signal: it resolves only once all bytes are durable, and
/// its error is the write's error. Dropping a sink without calling
/// either is treated like `abort`.
#[async_trait]
pub trait BlobSink: Send {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()>;

    async fn commit(self: Box<Self>) -> io::Result<()>;

    /// Discards the write. On atomic stores the previous blob, if any,
    /// stays visible.
    async fn abort(self: Box<Self>) -> io::Result<()>;
}

// == Blob Store ==
/// Abstract byte store the cache persists entries into.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn exists(&self, key: &str) -> io::Result<bool>;

    /// Opens a key for reading. Fails with `NotFound` when absent.
    async fn open_read(&self, key: &str) -> io::Result<ByteStream>;

    async fn open_write(&self, key: &str) -> io::Result<BlobWriter>;

    /// Removes a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> io::Result<()>;

    /// Whether a write becomes visible only on a successful commit.
    ///
    /// When false, readers may observe partially written blobs and the
    /// cache removes keys whose population failed.
    fn atomic_writes(&self) -> bool {
        true
    }
}

// == Stream Helpers ==
/// A stream yielding a single chunk.
pub fn once(bytes: impl Into<Bytes>) -> ByteStream {
    let bytes = bytes.into();
    Box::pin(stream::once(async move { Ok(bytes) }))
}

/// A stream yielding the given items in order.
pub fn from_chunks<I>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = io::Result<Bytes>>,
    I::IntoIter: Send + 'static,
{
    Box::pin(stream::iter(chunks))
}
