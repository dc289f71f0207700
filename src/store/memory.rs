//! In-memory blob store.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream;
use tokio::sync::RwLock;

use super::{BlobSink, BlobStore, BlobWriter, ByteStream};

const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// A blob kept as the chunks it was written in.
type Segments = Vec<Bytes>;

fn concat(segments: &[Bytes]) -> Bytes {
    match segments {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => {
            let total = many.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for segment in many {
                buf.extend_from_slice(segment);
            }
            buf.freeze()
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    blobs: RwLock<HashMap<String, Segments>>,
}

// == Memory Blob Store ==
/// Blob store keeping every blob in a shared map.
///
/// Writes are atomic by default: a blob is published on commit and an
/// aborted write leaves the previous blob untouched. With
/// [`visible_partial_writes`](Self::visible_partial_writes) the store
/// instead behaves like a plain file: opening truncates and every chunk
/// is appended where readers can see it as soon as it is written.
#[derive(Debug, Clone)]
pub struct MemoryBlobStore {
    shared: Arc<Shared>,
    read_chunk: usize,
    atomic: bool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::default(),
            read_chunk: DEFAULT_READ_CHUNK,
            atomic: true,
        }
    }

    /// Splits reads into chunks of at most `size` bytes.
    pub fn with_read_chunk(mut self, size: usize) -> Self {
        self.read_chunk = size.max(1);
        self
    }

    pub fn visible_partial_writes(mut self) -> Self {
        self.atomic = false;
        self
    }

    /// Raw stored bytes, header included.
    pub async fn raw(&self, key: &str) -> Option<Bytes> {
        self.shared
            .blobs
            .read()
            .await
            .get(key)
            .map(|segments| concat(segments))
    }

    /// Stores bytes verbatim, bypassing the cache framing.
    pub async fn insert_raw(&self, key: impl Into<String>, bytes: impl Into<Bytes>) {
        self.shared
            .blobs
            .write()
            .await
            .insert(key.into(), vec![bytes.into()]);
    }

    pub async fn len(&self) -> usize {
        self.shared.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.blobs.read().await.is_empty()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, key: &str) -> io::Result<bool> {
        Ok(self.shared.blobs.read().await.contains_key(key))
    }

    async fn open_read(&self, key: &str) -> io::Result<ByteStream> {
        let blob = self.raw(key).await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no blob stored at {key}"))
        })?;

        let size = self.read_chunk;
        let chunks: Vec<io::Result<Bytes>> = (0..blob.len())
            .step_by(size)
            .map(|start| Ok(blob.slice(start..(start + size).min(blob.len()))))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn open_write(&self, key: &str) -> io::Result<BlobWriter> {
        if !self.atomic {
            self.shared
                .blobs
                .write()
                .await
                .insert(key.to_string(), Segments::new());
        }
        Ok(Box::new(MemorySink {
            shared: self.shared.clone(),
            key: key.to_string(),
            pending: Segments::new(),
            atomic: self.atomic,
        }))
    }

    async fn remove(&self, key: &str) -> io::Result<()> {
        self.shared.blobs.write().await.remove(key);
        Ok(())
    }

    fn atomic_writes(&self) -> bool {
        self.atomic
    }
}

struct MemorySink {
    shared: Arc<Shared>,
    key: String,
    /// Unpublished chunks; always empty for non-atomic sinks
    pending: Segments,
    atomic: bool,
}

#[async_trait]
impl BlobSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        if self.atomic {
            self.pending.push(chunk);
        } else {
            self.shared
                .blobs
                .write()
                .await
                .entry(self.key.clone())
                .or_default()
                .push(chunk);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> io::Result<()> {
        let MemorySink {
            shared,
            key,
            pending,
            atomic,
        } = *self;
        if atomic {
            shared.blobs.write().await.insert(key, pending);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}
