//! Filesystem blob store.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::warn;

use super::{BlobSink, BlobStore, BlobWriter, ByteStream};

// == Fs Blob Store ==
/// Blob store keeping one file per key under a root directory.
///
/// Writes go to a hidden temporary file next to the destination and are
/// renamed into place on commit, so readers never see partial blobs.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    next_tmp: Arc<AtomicU64>,
}

impl FsBlobStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            next_tmp: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key to a path, rejecting keys that would escape the root.
    fn resolve(&self, key: &str) -> io::Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob key: {key:?}"),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn tmp_path(&self, dest: &Path) -> PathBuf {
        let id = self.next_tmp.fetch_add(1, Ordering::Relaxed);
        let name = dest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        dest.with_file_name(format!(".{name}.{}-{id}.tmp", std::process::id()))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, key: &str) -> io::Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn open_read(&self, key: &str) -> io::Result<ByteStream> {
        let file = File::open(self.resolve(key)?).await?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn open_write(&self, key: &str) -> io::Result<BlobWriter> {
        let dest = self.resolve(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = self.tmp_path(&dest);
        let file = File::create(&tmp).await?;
        Ok(Box::new(FsSink {
            file: Some(file),
            tmp,
            dest,
        }))
    }

    async fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(key)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

struct FsSink {
    file: Option<File>,
    tmp: PathBuf,
    dest: PathBuf,
}

impl FsSink {
    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "blob sink already closed"))
    }
}

#[async_trait]
impl BlobSink for FsSink {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.file()?.write_all(&chunk).await
    }

    async fn commit(self: Box<Self>) -> io::Result<()> {
        let mut this = self;
        let mut file = this.file.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "blob sink already closed")
        })?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&this.tmp, &this.dest).await {
            let _ = fs::remove_file(&this.tmp).await;
            return Err(err);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> io::Result<()> {
        let mut this = self;
        drop(this.file.take());
        match fs::remove_file(&this.tmp).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for FsSink {
    fn drop(&mut self) {
        // Dropped mid-write: the temp file is never renamed into place.
        if self.file.take().is_some() {
            if let Err(err) = std::fs::remove_file(&self.tmp) {
                warn!(path = ?self.tmp, error = %err, "Failed to remove abandoned temp blob");
            }
        }
    }
}
