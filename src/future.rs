//! Single-value, read-once asynchronous results.
//!
//! A [`FutureWriter`] settles its [`FutureReader`] at most once, with a value,
//! an error, or implicitly with nothing when the writer is dropped. These
//! futures cannot be cancelled: [`FutureReader::cancel`] does nothing and
//! the writer always gets to settle.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Creates a connected writer/reader pair sharing one deferred result.
pub fn future_pair<T, E>() -> (FutureWriter<T, E>, FutureReader<T, E>) {
    let (tx, rx) = oneshot::channel();
    (
        FutureWriter { tx },
        FutureReader {
            inner: Some(Inner::Channel(rx)),
        },
    )
}

#[derive(Debug)]
pub struct FutureWriter<T, E> {
    tx: oneshot::Sender<Result<T, E>>,
}

impl<T, E> FutureWriter<T, E> {
    pub fn resolve(self, value: T) {
        self.settle(Ok(value))
    }

    pub fn reject(self, err: E) {
        self.settle(Err(err))
    }

    /// Settles the future; a reader that is already gone is ignored.
    pub fn settle(self, result: Result<T, E>) {
        let _ = self.tx.send(result);
    }

    /// Closes the future without a value.
    pub fn close(self) {}

    /// Whether the reader has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct FutureReader<T, E> {
    inner: Option<Inner<T, E>>,
}

enum Inner<T, E> {
    Channel(oneshot::Receiver<Result<T, E>>),
    Deferred(BoxFuture<'static, Result<Option<T>, E>>),
}

impl<T, E> fmt::Debug for FutureReader<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureReader")
            .field("done", &self.inner.is_none())
            .finish()
    }
}

impl<T: Send + 'static, E: Send + 'static> FutureReader<T, E> {
    /// A reader settled by `future`, which is driven by whoever reads.
    ///
    /// Used to surface a background worker's completion reply.
    pub fn from_future(future: impl Future<Output = Result<T, E>> + Send + 'static) -> Self {
        FutureReader {
            inner: Some(Inner::Deferred(Box::pin(async move { future.await.map(Some) }))),
        }
    }
}

impl<T, E> FutureReader<T, E> {
    /// A future already resolved with `value`.
    pub fn ready(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// A future already rejected with `err`.
    pub fn failed(err: E) -> Self {
        Self::settled(Err(err))
    }

    fn settled(result: Result<T, E>) -> Self {
        let (tx, rx) = future_pair();
        tx.settle(result);
        rx
    }

    /// A future whose writer closed without a value.
    pub fn closed() -> Self {
        FutureReader { inner: None }
    }

    /// Waits for the settled value.
    ///
    /// Returns `Ok(None)` when the writer closed without a value, and on
    /// every read after the first.
    pub async fn read(&mut self) -> Result<Option<T>, E> {
        std::future::poll_fn(|cx| self.poll_read(cx)).await
    }

    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<T>, E>> {
        let result = match self.inner.as_mut() {
            None => return Poll::Ready(Ok(None)),
            Some(Inner::Channel(rx)) => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(result)) => result.map(Some),
                Poll::Ready(Err(_)) => Ok(None),
            },
            Some(Inner::Deferred(future)) => match future.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            },
        };
        self.inner = None;
        Poll::Ready(result)
    }

    /// Whether the value has been taken or the writer closed.
    pub fn is_done(&self) -> bool {
        self.inner.is_none()
    }

    /// Does nothing; futures cannot be cancelled.
    pub fn cancel(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn value_is_delivered_once() {
        let (tx, mut rx) = future_pair::<u32, String>();
        tokio::spawn(async move { tx.resolve(7) });
        assert_eq!(rx.read().await, Ok(Some(7)));
        assert_eq!(rx.read().await, Ok(None));
        assert!(rx.is_done());
    }

    #[tokio::test]
    async fn error_is_delivered_once() {
        let (tx, mut rx) = future_pair::<u32, String>();
        tx.reject("nope".to_string());
        assert_eq!(rx.read().await, Err("nope".to_string()));
        assert_eq!(rx.read().await, Ok(None));
    }

    #[tokio::test]
    async fn dropped_writer_reads_as_empty() {
        let (tx, mut rx) = future_pair::<u32, ()>();
        tx.close();
        assert_eq!(rx.read().await, Ok(None));
    }

    #[tokio::test]
    async fn cancel_does_not_prevent_settling() {
        let (tx, mut rx) = future_pair::<u32, ()>();
        rx.cancel();
        assert!(!tx.is_closed());
        tx.resolve(1);
        assert_eq!(rx.read().await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn deferred_readers_settle_once() {
        let mut rx = FutureReader::<_, ()>::from_future(async { Ok(5) });
        assert_eq!(rx.read().await, Ok(Some(5)));
        assert_eq!(rx.read().await, Ok(None));
    }

    #[tokio::test]
    async fn prebuilt_readers() {
        assert_eq!(FutureReader::<_, ()>::ready(3).read().await, Ok(Some(3)));
        assert_eq!(FutureReader::<u8, _>::failed(4).read().await, Err(4));
        assert_eq!(FutureReader::<u8, ()>::closed().read().await, Ok(None));
    }
}
