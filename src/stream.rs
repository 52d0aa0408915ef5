//! Single-producer, single-consumer streams used to move data between the
//! caller and background workers.
//!
//! A stream is created as a connected [`StreamWriter`] / [`StreamReader`]
//! pair by [`stream_pair`]. Each half is exclusively owned; moving a half
//! into a worker request is how a stream endpoint is "transferred". Items
//! arrive at the reader in write order. When the writer is dropped or closed
//! the reader observes end-of-stream after draining queued items, and every
//! subsequent read observes end-of-stream again.

use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Number of items a stream buffers before `write` waits for the reader.
pub const DEFAULT_STREAM_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The other end of the stream went away.
    #[error("stream closed")]
    Closed,
    /// The reader cancelled the stream with the given reason.
    #[error("stream cancelled: {0}")]
    Cancelled(String),
    /// The writer aborted the stream with an error.
    #[error("last operation failed: {0:#}")]
    LastOperationFailed(anyhow::Error),
}

impl StreamError {
    /// Attempts to recover a typed error from a writer abort.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            StreamError::LastOperationFailed(e) => e.downcast_ref(),
            _ => None,
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Closed => io::Error::from(io::ErrorKind::BrokenPipe),
            StreamError::Cancelled(reason) => io::Error::new(io::ErrorKind::Interrupted, reason),
            StreamError::LastOperationFailed(e) => match e.downcast::<io::Error>() {
                Ok(e) => e,
                Err(e) => io::Error::other(e),
            },
        }
    }
}

#[derive(Default)]
struct Shared {
    cancelled: Mutex<Option<String>>,
    aborted: Mutex<Option<anyhow::Error>>,
}

/// Creates a connected writer/reader pair.
pub fn stream_pair<T: Send + 'static>() -> (StreamWriter<T>, StreamReader<T>) {
    stream_pair_with_capacity(DEFAULT_STREAM_CAPACITY)
}

/// Like [`stream_pair`] with an explicit buffer capacity.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn stream_pair_with_capacity<T: Send + 'static>(
    capacity: usize,
) -> (StreamWriter<T>, StreamReader<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let shared = Arc::new(Shared::default());
    (
        StreamWriter {
            tx,
            shared: Arc::clone(&shared),
        },
        StreamReader {
            rx: Some(rx),
            shared,
        },
    )
}

/// The producing half of a stream.
pub struct StreamWriter<T> {
    tx: mpsc::Sender<T>,
    shared: Arc<Shared>,
}

impl<T: Send + 'static> StreamWriter<T> {
    fn closed_error(&self) -> StreamError {
        match self.shared.cancelled.lock().unwrap().clone() {
            Some(reason) => StreamError::Cancelled(reason),
            None => StreamError::Closed,
        }
    }

    /// Writes one item, waiting for buffer space.
    ///
    /// Fails once the reader has been closed or cancelled.
    pub async fn write(&mut self, item: T) -> Result<(), StreamError> {
        match self.tx.send(item).await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Blocking variant of [`StreamWriter::write`] for synchronous callers.
    ///
    /// Must not be called from within an asynchronous execution context.
    pub fn blocking_write(&mut self, item: T) -> Result<(), StreamError> {
        match self.tx.blocking_send(item) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Aborts the stream. The reader observes `err` once it has drained the
    /// items written before this call.
    pub fn abort(self, err: impl Into<anyhow::Error>) {
        *self.shared.aborted.lock().unwrap() = Some(err.into());
    }

    /// Ends the stream gracefully.
    pub fn close(self) {}

    /// Resolves once the reader has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> std::fmt::Debug for StreamWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

/// The consuming half of a stream.
pub struct StreamReader<T> {
    rx: Option<mpsc::Receiver<T>>,
    shared: Arc<Shared>,
}

impl<T: Send + 'static> StreamReader<T> {
    /// A stream that has already ended.
    pub fn empty() -> Self {
        StreamReader {
            rx: None,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Reads the next item, `None` at end-of-stream.
    ///
    /// An abort from the writer is reported once; afterwards the stream is
    /// ended.
    pub async fn read(&mut self) -> Result<Option<T>, StreamError> {
        std::future::poll_fn(|cx| self.poll_read(cx)).await
    }

    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<T>, StreamError>> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Ok(None));
        };
        match rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(item)) => Poll::Ready(Ok(Some(item))),
            Poll::Ready(None) => {
                self.rx = None;
                match self.shared.aborted.lock().unwrap().take() {
                    Some(err) => Poll::Ready(Err(StreamError::LastOperationFailed(err))),
                    None => Poll::Ready(Ok(None)),
                }
            }
        }
    }

    /// Whether end-of-stream has been observed.
    pub fn is_ended(&self) -> bool {
        self.rx.is_none()
    }

    /// Cancels the stream; the writer's next write fails with
    /// [`StreamError::Cancelled`].
    pub fn cancel(self, reason: impl Into<String>) {
        *self.shared.cancelled.lock().unwrap() = Some(reason.into());
    }

    /// Releases the reader without draining it.
    pub fn close(self) {}
}

impl<T> std::fmt::Debug for StreamReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("ended", &self.rx.is_none())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> futures::Stream for StreamReader<T> {
    type Item = Result<T, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_read(cx).map(Result::transpose)
    }
}

impl StreamReader<Bytes> {
    /// Converts the stream into a raw byte pipe.
    pub fn into_async_read(self) -> tokio_util::io::StreamReader<Self, Bytes> {
        tokio_util::io::StreamReader::new(self)
    }

    /// Reads every remaining chunk into one buffer.
    pub async fn read_all(&mut self) -> Result<Bytes, StreamError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn items_arrive_in_order_then_end_repeats() {
        let (mut tx, mut rx) = stream_pair();
        tokio::spawn(async move {
            for i in 0..100u32 {
                tx.write(i).await.unwrap();
            }
        });
        for i in 0..100u32 {
            assert_eq!(rx.read().await.unwrap(), Some(i));
        }
        assert_eq!(rx.read().await.unwrap(), None);
        assert_eq!(rx.read().await.unwrap(), None);
        assert!(rx.is_ended());
    }

    #[tokio::test]
    async fn abort_is_delivered_after_queued_items() {
        let (mut tx, mut rx) = stream_pair();
        tx.write(1).await.unwrap();
        tx.abort(anyhow::anyhow!("disk on fire"));
        assert_eq!(rx.read().await.unwrap(), Some(1));
        let err = rx.read().await.unwrap_err();
        assert!(matches!(err, StreamError::LastOperationFailed(_)));
        assert!(err.to_string().contains("disk on fire"));
        assert_eq!(rx.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_is_seen_by_the_writer() {
        let (mut tx, rx) = stream_pair::<u8>();
        rx.cancel("not interested");
        match tx.write(1).await {
            Err(StreamError::Cancelled(reason)) => assert_eq!(reason, "not interested"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn close_without_draining() {
        let (mut tx, rx) = stream_pair::<u8>();
        tx.write(1).await.unwrap();
        rx.close();
        assert!(matches!(tx.write(2).await, Err(StreamError::Closed)));
        tx.closed().await;
    }

    #[tokio::test]
    async fn byte_streams_convert_into_async_read() {
        let (mut tx, rx) = stream_pair();
        tx.write(Bytes::from_static(b"hello ")).await.unwrap();
        tx.write(Bytes::from_static(b"world")).await.unwrap();
        tx.close();
        let mut out = String::new();
        rx.into_async_read().read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn implements_futures_stream() {
        let (mut tx, rx) = stream_pair();
        tx.write("a").await.unwrap();
        tx.write("b").await.unwrap();
        drop(tx);
        let items: Vec<_> = rx.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, ["a", "b"]);
    }

    #[test]
    fn empty_stream_is_ended() {
        let mut rx = StreamReader::<Bytes>::empty();
        let got = crate::runtime::in_tokio(rx.read_all()).unwrap();
        assert!(got.is_empty());
    }
}
