//! Cache Engine Module
//!
//! Get/set/delete over a blob store with lazy TTL expiry and the
//! get-or-compute pattern.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::cache::codec::{CacheValue, TypeName};
use crate::cache::metadata::{read_header, Metadata};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result, StoreOp};
use crate::store::{BlobStore, BlobWriter, ByteStream};

// == Options ==
/// Options for [`Cache::set`] and [`Cache::writer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Entry lifetime, `None` = never expires
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the TTL in (fractional) seconds. Infinite, NaN or negative
    /// values mean the entry never expires.
    pub fn with_ttl_secs(mut self, secs: f64) -> Self {
        self.ttl = Duration::try_from_secs_f64(secs).ok();
        self
    }
}

/// Options for [`Cache::get_or_set`] and its streaming counterpart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOrSetOptions {
    /// Lifetime of a freshly computed entry
    pub ttl: Option<Duration>,
    /// Skip the cached value and always recompute
    pub refresh: bool,
}

impl GetOrSetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn refresh(mut self) -> Self {
        self.refresh = true;
        self
    }

    pub fn set_options(&self) -> SetOptions {
        SetOptions { ttl: self.ttl }
    }
}

// == Entry ==
/// A fresh entry opened for streaming.
pub struct Entry {
    pub metadata: Metadata,
    /// Value bytes following the header, still encoded
    pub body: ByteStream,
}

// == Cache ==
/// Cache over a shared blob store.
///
/// Cloning is cheap; clones share the store. No operation is serialized
/// against another: concurrent misses on one key all compute and write,
/// and the last write wins.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn BlobStore>,
    config: Arc<CacheConfig>,
}

impl Cache {
    // == Constructor ==
    /// Creates a cache over `store`.
    pub fn new<S: BlobStore>(store: S, config: CacheConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    pub fn from_shared(store: Arc<dyn BlobStore>, config: CacheConfig) -> Self {
        debug!("Initializing cache with key prefix {:?}", config.key_prefix);
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key as seen by the blob store.
    pub fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    // == Exists ==
    /// Checks whether an entry is stored under `key`.
    ///
    /// Does not look at the TTL: an expired entry exists until the next
    /// read removes it.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.store
            .exists(&self.full_key(key))
            .await
            .map_err(|err| CacheError::adapter(key, StoreOp::Exists, err))
    }

    // == Open ==
    /// Opens a fresh entry, returning its metadata and encoded body.
    ///
    /// Fails with [`CacheError::KeyNotExists`] when the key is absent. An
    /// expired entry is deleted first and reported with `expired == true`.
    pub async fn open(&self, key: &str) -> Result<Entry> {
        if !self.exists(key).await? {
            debug!("Cache miss for key {}", key);
            return Err(CacheError::not_exists(key));
        }

        let source = match self.store.open_read(&self.full_key(key)).await {
            Ok(source) => source,
            // Removed between the existence check and the read
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Key {} vanished before it could be read", key);
                return Err(CacheError::not_exists(key));
            }
            Err(err) => return Err(CacheError::adapter(key, StoreOp::Read, err)),
        };

        let (metadata, body) = read_header(key, source).await?;
        if metadata.is_expired() {
            info!("Key {} expired, removing", key);
            drop(body);
            self.del(key).await?;
            return Err(CacheError::expired(key));
        }

        debug!("Cache hit for key {} ({})", key, metadata.type_name);
        Ok(Entry { metadata, body })
    }

    // == Get ==
    /// Reads and decodes the value stored under `key`.
    pub async fn get(&self, key: &str) -> Result<CacheValue> {
        let Entry { metadata, mut body } = self.open(key).await?;

        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| CacheError::from_io(err, key, StoreOp::Read))?;
            buf.extend_from_slice(&chunk);
        }
        metadata.type_name.decode(buf.freeze())
    }

    /// Returns the stored bytes after the header, without decoding.
    pub async fn get_raw(&self, key: &str) -> Result<ByteStream> {
        Ok(self.open(key).await?.body)
    }

    // == Set ==
    /// Encodes and stores `value` under `key`.
    ///
    /// Resolves once the store acknowledges the complete write.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        opts: SetOptions,
    ) -> Result<()> {
        let value = value.into();
        let type_name = TypeName::infer(&value);
        let encoded = type_name.encode(&value)?;

        let mut writer = self.open_writer(key, type_name, opts).await?;
        if let Err(err) = writer.write(encoded).await {
            writer.discard().await;
            return Err(err);
        }
        writer.finish().await?;

        debug!("Stored key {} ({})", key, type_name);
        Ok(())
    }

    /// Opens a streaming write for `key` with the header already written.
    ///
    /// The body is recorded as binary; readers get back exactly the bytes
    /// written.
    pub async fn writer(&self, key: &str, opts: SetOptions) -> Result<EntryWriter> {
        let type_name = TypeName::infer(&CacheValue::Binary(Bytes::new()));
        self.open_writer(key, type_name, opts).await
    }

    async fn open_writer(
        &self,
        key: &str,
        type_name: TypeName,
        opts: SetOptions,
    ) -> Result<EntryWriter> {
        let header = Metadata::new(type_name, opts.ttl).encode()?;
        let full_key = self.full_key(key);
        let sink = self
            .store
            .open_write(&full_key)
            .await
            .map_err(|err| CacheError::adapter(key, StoreOp::Write, err))?;

        let mut writer = EntryWriter {
            key: key.to_string(),
            full_key,
            store: self.store.clone(),
            sink: Some(sink),
        };
        if let Err(err) = writer.write(header).await {
            writer.discard().await;
            return Err(err);
        }
        Ok(writer)
    }

    // == Delete ==
    /// Removes `key`. Removing an absent key succeeds.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.store
            .remove(&self.full_key(key))
            .await
            .map_err(|err| CacheError::adapter(key, StoreOp::Remove, err))?;
        debug!("Deleted key {}", key);
        Ok(())
    }

    // == Get Or Set ==
    /// Returns the cached value, or computes, stores and returns it.
    ///
    /// `compute` runs only on a miss (ordinary or expired) or when
    /// `opts.refresh` is set. Any other read failure is returned without
    /// computing.
    pub async fn get_or_set<F, Fut, V>(
        &self,
        key: &str,
        compute: F,
        opts: GetOrSetOptions,
    ) -> Result<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
        V: Into<CacheValue>,
    {
        if !opts.refresh {
            match self.get(key).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_key_not_exists() => {
                    debug!("Computing value for key {} (expired: {})", key, err.is_expired());
                }
                Err(err) => return Err(err),
            }
        }

        let value: CacheValue = compute().await.map_err(CacheError::Compute)?.into();
        self.set(key, value.clone(), opts.set_options()).await?;
        Ok(value)
    }

}

/// Removes what a failed write may have left behind on stores where
/// partial writes are visible.
async fn discard_partial(store: &dyn BlobStore, full_key: &str, key: &str) {
    if store.atomic_writes() {
        return;
    }
    match store.remove(full_key).await {
        Ok(()) => debug!("Removed partial write for key {}", key),
        Err(err) => warn!("Failed to remove partial write for key {}: {}", key, err),
    }
}

// == Entry Writer ==
/// Write handle for an entry whose header is already written.
///
/// Dropping it without [`finish`](Self::finish) or [`abort`](Self::abort)
/// abandons the write. On stores where partial writes are visible the key
/// is then removed in the background, which needs a tokio runtime.
pub struct EntryWriter {
    key: String,
    full_key: String,
    store: Arc<dyn BlobStore>,
    /// `None` once the write has been finished or aborted
    sink: Option<BlobWriter>,
}

impl EntryWriter {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn closed(&self) -> CacheError {
        CacheError::Closed {
            key: self.key.clone(),
        }
    }

    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(self.closed());
        };
        sink.write(chunk)
            .await
            .map_err(|err| CacheError::adapter(&self.key, StoreOp::Write, err))
    }

    /// Commits the entry. Resolves once the store reports it durable.
    pub async fn finish(mut self) -> Result<()> {
        let Some(sink) = self.sink.take() else {
            return Err(self.closed());
        };
        if let Err(err) = sink.commit().await {
            discard_partial(self.store.as_ref(), &self.full_key, &self.key).await;
            return Err(CacheError::adapter(&self.key, StoreOp::Commit, err));
        }
        Ok(())
    }

    /// Abandons the entry; a previously stored value is kept on atomic stores.
    pub async fn abort(mut self) -> Result<()> {
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };
        let aborted = sink.abort().await;
        discard_partial(self.store.as_ref(), &self.full_key, &self.key).await;
        aborted.map_err(|err| CacheError::adapter(&self.key, StoreOp::Write, err))
    }

    /// Aborts, logging instead of returning a failure.
    pub(crate) async fn discard(self) {
        let key = self.key.clone();
        if let Err(err) = self.abort().await {
            warn!("Failed to abort write for key {}: {}", key, err);
        }
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        // Dropped mid-write: the sink itself is released here.
        if self.sink.take().is_none() || self.store.atomic_writes() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let full_key = std::mem::take(&mut self.full_key);
                let key = std::mem::take(&mut self.key);
                debug!("Writer for key {} dropped unfinished, removing partial write", key);
                handle.spawn(async move {
                    discard_partial(store.as_ref(), &full_key, &key).await;
                });
            }
            Err(_) => warn!(
                "Writer for key {} dropped outside a runtime, partial write left in place",
                self.key
            ),
        }
    }
}
