//! Streaming Bridge Module
//!
//! Streaming counterparts of get, set and get-or-set. Each returns a
//! [`CacheDuplex`] right away; the cache read or write behind it is set
//! up by a spawned task and attached when ready.
//!
//! On a get-or-set miss one producer stream feeds two destinations: the
//! cache write and the caller-facing reader. Each chunk is handed to both
//! before the next one is pulled, so the slower side throttles the
//! producer and neither side loses data.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{ready, stream, Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::cache::engine::{Cache, EntryWriter, GetOrSetOptions, SetOptions};
use crate::error::{CacheError, Result, StoreOp};
use crate::store::ByteStream;

/// Message from a handle's writable side to its write task.
enum WriteFrame {
    Chunk(Bytes),
    End,
    Fail(io::Error),
}

/// Readable capability of a handle.
enum ReadSlot {
    /// Not attached yet; filled exactly once by the setup task
    Pending(oneshot::Receiver<io::Result<ByteStream>>),
    Attached(ByteStream),
    Done,
}

enum Finished {
    Pending(oneshot::Receiver<Result<()>>),
    Reported,
}

// == Cache Duplex ==
/// Handle returned by the streaming operations.
///
/// Read it as a [`Stream`] of chunks. Reads issued before the underlying
/// source is attached wait for it; nothing is lost. Setup failures show
/// up as an error item followed by the end of the stream.
///
/// Handles from [`Cache::set_stream`] are also writable: chunks are queued
/// (bounded, so writers feel backpressure) until the cache write is open.
/// [`finish`](Self::finish) reports whether the cache write completed.
/// Dropping a writable handle without finishing abandons the write.
pub struct CacheDuplex {
    key: String,
    readable: ReadSlot,
    writable: Option<mpsc::Sender<WriteFrame>>,
    finished: Finished,
}

impl CacheDuplex {
    fn new(
        key: &str,
        readable: ReadSlot,
        writable: Option<mpsc::Sender<WriteFrame>>,
        finished: oneshot::Receiver<Result<()>>,
    ) -> Self {
        Self {
            key: key.to_string(),
            readable,
            writable,
            finished: Finished::Pending(finished),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_writable(&self) -> bool {
        self.writable.is_some()
    }

    // == Writable Side ==
    /// Queues a chunk for the cache write.
    ///
    /// Waits while the queue is full. Fails if the handle is not writable
    /// or the write already failed, with that failure as the error.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        let Some(tx) = self.writable.as_ref() else {
            return Err(self.closed());
        };
        if tx.send(WriteFrame::Chunk(chunk.into())).await.is_ok() {
            return Ok(());
        }

        self.writable = None;
        match self.wait_finished().await {
            Err(err) => Err(err),
            Ok(()) => Err(self.closed()),
        }
    }

    /// Abandons the write because its source failed.
    ///
    /// [`finish`](Self::finish) then reports `err` as a producer failure.
    pub async fn fail(&mut self, err: io::Error) {
        if let Some(tx) = self.writable.take() {
            let _ = tx.send(WriteFrame::Fail(err)).await;
        }
    }

    /// Ends the input (if writable) and waits for the cache write to settle.
    ///
    /// For get-or-set handles this resolves once the computed value has
    /// been stored, or immediately when it was served from the cache. The
    /// outcome is reported once; later calls return `Ok(())`.
    pub async fn finish(&mut self) -> Result<()> {
        if let Some(tx) = self.writable.take() {
            // A closed channel means the task already settled.
            let _ = tx.send(WriteFrame::End).await;
        }
        self.wait_finished().await
    }

    /// Writes every chunk of `source`, then finishes.
    ///
    /// A failing source aborts the write and is returned as
    /// [`CacheError::Producer`].
    pub async fn send_all<S>(&mut self, source: S) -> Result<()>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        futures::pin_mut!(source);
        while let Some(item) = source.next().await {
            match item {
                Ok(chunk) => self.write(chunk).await?,
                Err(err) => {
                    let reported = io::Error::new(err.kind(), err.to_string());
                    self.fail(err).await;
                    let _ = self.wait_finished().await;
                    return Err(CacheError::Producer(reported));
                }
            }
        }
        self.finish().await
    }

    // == Readable Side ==
    /// Reads the remaining bytes into memory.
    pub async fn read_all(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            let chunk = chunk.map_err(|err| CacheError::from_io(err, &self.key, StoreOp::Read))?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Stops reading. A read-through keeps populating the cache.
    pub fn close_reader(&mut self) {
        self.readable = ReadSlot::Done;
    }

    /// Adapts the readable side to [`AsyncRead`].
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self)
    }

    async fn wait_finished(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.finished, Finished::Reported) {
            Finished::Pending(rx) => rx.await.unwrap_or_else(|_| Err(self.closed())),
            Finished::Reported => Ok(()),
        }
    }

    fn closed(&self) -> CacheError {
        CacheError::Closed {
            key: self.key.clone(),
        }
    }
}

impl Stream for CacheDuplex {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.readable {
                ReadSlot::Pending(rx) => match ready!(Pin::new(rx).poll(cx)) {
                    Ok(Ok(source)) => this.readable = ReadSlot::Attached(source),
                    Ok(Err(err)) => {
                        this.readable = ReadSlot::Done;
                        return Poll::Ready(Some(Err(err)));
                    }
                    Err(_) => {
                        this.readable = ReadSlot::Done;
                        return Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            format!("stream for key {} was never attached", this.key),
                        ))));
                    }
                },
                ReadSlot::Attached(source) => {
                    let item = ready!(source.as_mut().poll_next(cx));
                    if item.is_none() {
                        this.readable = ReadSlot::Done;
                    }
                    return Poll::Ready(item);
                }
                ReadSlot::Done => return Poll::Ready(None),
            }
        }
    }
}

/// Stream over the receiving end of a chunk channel.
fn channel_stream(rx: mpsc::Receiver<io::Result<Bytes>>) -> ByteStream {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

impl Cache {
    // == Get Stream ==
    /// Streams the raw bytes stored under `key`.
    ///
    /// A failed read (including a miss) surfaces as the handle's first
    /// item. Must be called within a tokio runtime.
    pub fn get_stream(&self, key: &str) -> CacheDuplex {
        let (read_tx, read_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let _ = done_tx.send(Ok(()));

        let cache = self.clone();
        let owned_key = key.to_string();
        tokio::spawn(async move {
            let source = cache.get_raw(&owned_key).await.map_err(CacheError::into_io);
            let _ = read_tx.send(source);
        });

        CacheDuplex::new(key, ReadSlot::Pending(read_rx), None, done_rx)
    }

    // == Set Stream ==
    /// Returns a writable handle storing whatever is written to it under
    /// `key`. Must be called within a tokio runtime.
    pub fn set_stream(&self, key: &str, opts: SetOptions) -> CacheDuplex {
        let (frame_tx, frame_rx) = mpsc::channel(self.config().stream_buffer.max(1));
        let (done_tx, done_rx) = oneshot::channel();

        let cache = self.clone();
        let owned_key = key.to_string();
        tokio::spawn(async move {
            let outcome = cache.drain_into_cache(&owned_key, opts, frame_rx).await;
            match &outcome {
                Ok(()) => debug!("Streamed write for key {} committed", owned_key),
                Err(err) => warn!("Streamed write for key {} failed: {}", owned_key, err),
            }
            let _ = done_tx.send(outcome);
        });

        CacheDuplex::new(key, ReadSlot::Done, Some(frame_tx), done_rx)
    }

    async fn drain_into_cache(
        &self,
        key: &str,
        opts: SetOptions,
        mut frames: mpsc::Receiver<WriteFrame>,
    ) -> Result<()> {
        let mut writer = self.writer(key, opts).await?;
        loop {
            match frames.recv().await {
                Some(WriteFrame::Chunk(chunk)) => {
                    if let Err(err) = writer.write(chunk).await {
                        writer.discard().await;
                        return Err(err);
                    }
                }
                Some(WriteFrame::End) => return writer.finish().await,
                Some(WriteFrame::Fail(err)) => {
                    writer.discard().await;
                    return Err(CacheError::Producer(err));
                }
                None => {
                    debug!("Handle for key {} dropped before finishing", key);
                    writer.discard().await;
                    return Err(CacheError::Closed {
                        key: key.to_string(),
                    });
                }
            }
        }
    }

    // == Get Or Set Stream ==
    /// Streams the cached bytes for `key`, or computes, stores and streams
    /// them.
    ///
    /// On a miss (or with `opts.refresh`) the stream from `compute` is
    /// written to the cache while the same bytes are served through the
    /// handle. [`CacheDuplex::finish`] resolves when the cache write
    /// settles. If the producer fails, the handle yields its error and the
    /// entry is not left readable. Must be called within a tokio runtime.
    pub fn get_or_set_stream<F, Fut>(
        &self,
        key: &str,
        compute: F,
        opts: GetOrSetOptions,
    ) -> CacheDuplex
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<ByteStream>> + Send + 'static,
    {
        let (read_tx, read_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let cache = self.clone();
        let owned_key = key.to_string();
        tokio::spawn(async move {
            let outcome = cache
                .read_through(&owned_key, compute, opts, read_tx)
                .await;
            if let Err(err) = &outcome {
                warn!("Read-through for key {} failed: {}", owned_key, err);
            }
            let _ = done_tx.send(outcome);
        });

        CacheDuplex::new(key, ReadSlot::Pending(read_rx), None, done_rx)
    }

    async fn read_through<F, Fut>(
        &self,
        key: &str,
        compute: F,
        opts: GetOrSetOptions,
        reader: oneshot::Sender<io::Result<ByteStream>>,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<ByteStream>>,
    {
        if !opts.refresh {
            match self.get_raw(key).await {
                Ok(source) => {
                    // Served from cache: nothing to write.
                    let _ = reader.send(Ok(source));
                    return Ok(());
                }
                Err(err) if err.is_key_not_exists() => {
                    debug!("Computing stream for key {} (expired: {})", key, err.is_expired());
                }
                Err(err) => {
                    let _ = reader.send(Err(err.replicate().into_io()));
                    return Err(err);
                }
            }
        }

        let producer = match compute().await {
            Ok(producer) => producer,
            Err(err) => {
                let err = CacheError::Compute(err);
                let _ = reader.send(Err(err.replicate().into_io()));
                return Err(err);
            }
        };

        let (body_tx, body_rx) = mpsc::channel(self.config().stream_buffer.max(1));
        let _ = reader.send(Ok(channel_stream(body_rx)));

        let writer = match self.writer(key, opts.set_options()).await {
            Ok(writer) => Ok(writer),
            Err(err) => {
                warn!("Cannot cache key {}, serving uncached: {}", key, err);
                Err(err)
            }
        };
        self.fan_out(key, producer, body_tx, writer).await
    }

    /// Copies `producer` into both the reader channel and the cache writer.
    async fn fan_out(
        &self,
        key: &str,
        mut producer: ByteStream,
        body_tx: mpsc::Sender<io::Result<Bytes>>,
        writer: Result<EntryWriter>,
    ) -> Result<()> {
        let (mut writer, mut write_error) = match writer {
            Ok(writer) => (Some(writer), None),
            Err(err) => (None, Some(err)),
        };
        let mut reader_open = true;

        while let Some(item) = producer.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let reported = io::Error::new(err.kind(), err.to_string());
                    // The partial entry must be gone before the reader learns of the failure.
                    if let Some(writer) = writer.take() {
                        writer.discard().await;
                    }
                    if reader_open {
                        let _ = body_tx.send(Err(err)).await;
                    }
                    return Err(CacheError::Producer(reported));
                }
            };

            let reader_chunk = chunk.clone();
            let tx = reader_open.then_some(&body_tx);
            let sink = writer.as_mut();
            let (delivered, written) = tokio::join!(
                async move {
                    match tx {
                        Some(tx) => tx.send(Ok(reader_chunk)).await.is_ok(),
                        None => false,
                    }
                },
                async move {
                    match sink {
                        Some(sink) => Some(sink.write(chunk).await),
                        None => None,
                    }
                },
            );

            if reader_open && !delivered {
                debug!("Reader for key {} went away, still populating cache", key);
                reader_open = false;
            }
            if let Some(Err(err)) = written {
                warn!("Cache write for key {} failed mid-stream: {}", key, err);
                if let Some(writer) = writer.take() {
                    writer.discard().await;
                }
                write_error = Some(err);
            }
            if !reader_open && writer.is_none() {
                break;
            }
        }

        drop(body_tx);
        match (writer, write_error) {
            (_, Some(err)) => Err(err),
            (Some(writer), None) => {
                writer.finish().await?;
                debug!("Populated key {} from computed stream", key);
                Ok(())
            }
            (None, None) => Err(CacheError::Closed {
                key: key.to_string(),
            }),
        }
    }
}
