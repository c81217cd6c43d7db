//! Chunked, abortable byte streams returned by [`FileSystem::get`].
//!
//! A [`ReadStream`] is fed by a background producer (a blocking reader
//! thread for local files and SFTP, or pre-split chunks for in-memory
//! data) through a bounded channel. Aborting goes through a cloneable
//! [`AbortHandle`]: once aborted, the stream yields [`FileError::Cancelled`]
//! and producers stop at their next chunk.
//!
//! [`FileSystem::get`]: super::FileSystem::get

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::FileError;

/// Size of the chunks produced by the built-in backends.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks buffered between a producer and its stream.
const STREAM_CHANNEL_CAPACITY: usize = 4;

type Chunk = Result<Vec<u8>, FileError>;
type ChunkInspector = Box<dyn FnMut(usize) + Send>;

/// Cloneable handle that aborts a [`ReadStream`].
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Abort the stream. Safe to call any number of times; never fails.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Whether [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Producer side of a [`ReadStream`].
pub struct ChunkSender {
    tx: mpsc::Sender<Chunk>,
    abort: AbortHandle,
}

impl ChunkSender {
    /// Send a chunk, waiting for buffer space.
    ///
    /// Returns `false` when the stream was aborted or dropped; the producer
    /// should stop reading.
    pub async fn send(&self, chunk: Chunk) -> bool {
        if self.abort.is_aborted() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.abort.token.cancelled() => false,
            sent = self.tx.send(chunk) => sent.is_ok(),
        }
    }

    /// Blocking variant of [`send`](Self::send) for `spawn_blocking` producers.
    pub fn blocking_send(&self, chunk: Chunk) -> bool {
        if self.abort.is_aborted() {
            return false;
        }
        self.tx.blocking_send(chunk).is_ok()
    }

    /// Whether the consuming stream has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }
}

/// A readable byte stream obtained from a filesystem.
///
/// The stream belongs to whoever holds it; only the [`AbortHandle`] may be
/// shared.
pub struct ReadStream {
    rx: mpsc::Receiver<Chunk>,
    abort: AbortHandle,
    inspector: Option<ChunkInspector>,
}

impl ReadStream {
    /// Create a stream together with the sender its producer writes into.
    pub fn channel() -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let abort = AbortHandle::default();
        let sender = ChunkSender {
            tx,
            abort: abort.clone(),
        };
        let stream = Self {
            rx,
            abort,
            inspector: None,
        };
        (sender, stream)
    }

    /// A stream over in-memory data, split into `chunk_size` pieces.
    ///
    /// Needs no runtime: every chunk is buffered up front.
    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // Capacity equals the chunk count, so this cannot fail.
            let _ = tx.try_send(Ok(chunk.to_vec()));
        }
        Self {
            rx,
            abort: AbortHandle::default(),
            inspector: None,
        }
    }

    /// A stream that ends immediately.
    pub fn empty() -> Self {
        Self::from_bytes(&[], 1)
    }

    /// Handle that can abort this stream from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Abort the stream.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Call `inspector` with the length of every chunk as it is consumed.
    ///
    /// The inspector runs before the chunk is handed to the consumer. If it
    /// aborts the stream, that chunk is dropped and the read fails with
    /// [`FileError::Cancelled`].
    pub fn inspect_chunks<F>(mut self, inspector: F) -> Self
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.inspector = Some(Box::new(inspector));
        self
    }

    /// Receive the next chunk; `Ok(None)` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FileError> {
        if self.abort.is_aborted() {
            return Err(FileError::Cancelled);
        }
        let next = tokio::select! {
            biased;
            _ = self.abort.token.cancelled() => return Err(FileError::Cancelled),
            next = self.rx.recv() => next,
        };
        self.accept(next)
    }

    /// Blocking variant of [`next_chunk`](Self::next_chunk).
    ///
    /// Must only be called from a blocking context (`spawn_blocking`).
    pub fn blocking_next_chunk(&mut self) -> Result<Option<Vec<u8>>, FileError> {
        if self.abort.is_aborted() {
            return Err(FileError::Cancelled);
        }
        let next = self.rx.blocking_recv();
        self.accept(next)
    }

    /// Drain the whole stream into memory.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, FileError> {
        let mut data = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    fn accept(&mut self, next: Option<Chunk>) -> Result<Option<Vec<u8>>, FileError> {
        // A producer stops (and drops its sender) when it sees the abort,
        // so end-of-stream after an abort is a cancellation, not EOF.
        if self.abort.is_aborted() {
            return Err(FileError::Cancelled);
        }
        match next {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(chunk)) => {
                if let Some(inspect) = self.inspector.as_mut() {
                    inspect(chunk.len());
                }
                if self.abort.is_aborted() {
                    return Err(FileError::Cancelled);
                }
                Ok(Some(chunk))
            }
        }
    }
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("aborted", &self.is_aborted())
            .field("inspected", &self.inspector.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn from_bytes_yields_chunks_in_order() {
        let mut stream = ReadStream::from_bytes(b"hello world", 4);
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"hell");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"o wo");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"rld");
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_stream_ends_immediately() {
        let data = ReadStream::empty().read_to_end().await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn abort_fails_subsequent_reads() {
        let mut stream = ReadStream::from_bytes(b"abcdef", 2);
        let handle = stream.abort_handle();
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"ab");

        handle.abort();
        handle.abort();
        assert!(stream.is_aborted());
        assert!(matches!(
            stream.next_chunk().await,
            Err(FileError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn inspector_sees_every_chunk() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let stream = ReadStream::from_bytes(&[7u8; 10], 3).inspect_chunks(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        });
        let data = stream.read_to_end().await.unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn inspector_abort_drops_current_chunk() {
        let stream = ReadStream::from_bytes(b"abcdef", 2);
        let handle = stream.abort_handle();
        let mut stream = stream.inspect_chunks(move |_| handle.abort());
        assert!(matches!(
            stream.next_chunk().await,
            Err(FileError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn channel_producer_stops_after_abort() {
        let (tx, mut stream) = ReadStream::channel();
        assert!(tx.send(Ok(b"one".to_vec())).await);
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"one");

        stream.abort();
        assert!(tx.is_aborted());
        assert!(!tx.send(Ok(b"two".to_vec())).await);
    }

    #[tokio::test]
    async fn producer_error_is_forwarded() {
        let (tx, mut stream) = ReadStream::channel();
        assert!(
            tx.send(Err(FileError::OperationFailed("read failed".into())))
                .await
        );
        assert!(matches!(
            stream.next_chunk().await,
            Err(FileError::OperationFailed(_))
        ));
    }

    #[tokio::test]
    async fn dropped_sender_is_end_of_stream() {
        let (tx, mut stream) = ReadStream::channel();
        drop(tx);
        assert!(stream.next_chunk().await.unwrap().is_none());
    }
}
