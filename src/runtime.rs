//! This module provides an "ambient Tokio runtime"
//! [`with_ambient_tokio_runtime`]. Embedders of this crate may call into it
//! from synchronous Rust and never touch tokio directly, yet the front-end
//! resources still need an executor for their reply channels and accept
//! loops. When used from a synchronous context this module provides
//! [`in_tokio`], which blocks on a future using the fallback runtime.
//!
//! This module also provides a thin wrapper on tokio's tasks,
//! [`AbortOnDropJoinHandle`], which is exactly like a
//! [`tokio::task::JoinHandle`] except that dropping it aborts the task. The
//! whole crate should use this module's [`spawn`] and [`spawn_blocking`] over
//! tokio's so that tasks never outlive the resource that owns them.

mod task;

use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::task::{Context, Poll};

pub use task::AbortOnDropJoinHandle;

pub(crate) static RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("preview2-shim-ambient")
        .enable_time()
        .enable_io()
        .build()
        .unwrap()
});

/// Spawns `f` on the current tokio runtime, or on the ambient runtime when
/// called outside of one.
pub fn spawn<F>(f: F) -> AbortOnDropJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let j = with_ambient_tokio_runtime(|| tokio::task::spawn(f));
    AbortOnDropJoinHandle::from(j)
}

/// Spawns a task that nothing owns.
///
/// Only for tasks that end on their own once the channels they feed are
/// closed, such as body pumps and connection drivers.
pub(crate) fn spawn_detached<F>(f: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    with_ambient_tokio_runtime(|| drop(tokio::task::spawn(f)));
}

/// Runs the blocking closure `f` on tokio's blocking thread pool.
pub fn spawn_blocking<F, R>(f: F) -> AbortOnDropJoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let j = with_ambient_tokio_runtime(|| tokio::task::spawn_blocking(f));
    AbortOnDropJoinHandle::from(j)
}

/// Blocks the current thread on `f`.
///
/// Must not be called from within an asynchronous task on a current-thread
/// runtime; use the `async` variant of the operation instead.
pub fn in_tokio<F: Future>(f: F) -> F::Output {
    match tokio::runtime::Handle::try_current() {
        Ok(h) => {
            let _enter = h.enter();
            h.block_on(f)
        }
        // The `yield_now` gives the runtime a chance to process I/O events
        // before `f` is first polled, otherwise a future that is immediately
        // ready can starve readiness notifications for other resources.
        Err(_) => {
            let _enter = RUNTIME.enter();
            RUNTIME.block_on(async move {
                tokio::task::yield_now().await;
                f.await
            })
        }
    }
}

/// Executes the closure `f` with an "ambient Tokio runtime" which basically
/// means that if code in `f` tries to get a runtime `Handle` it'll succeed.
///
/// If a `Handle` is already available, e.g. in async contexts, then `f` is run
/// immediately. Otherwise for synchronous contexts this crate's fallback
/// runtime is configured and then `f` is executed.
pub fn with_ambient_tokio_runtime<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(_) => f(),
        Err(_) => {
            let _enter = RUNTIME.enter();
            f()
        }
    }
}

/// Attempts to get the result of a `future`.
///
/// This function does not block and will poll the provided future once. If the
/// result is here then `Some` is returned, otherwise `None` is returned.
///
/// Note that by polling `future` this means that `future` must be re-polled
/// later if it's to wake up a task.
pub fn poll_noop<F>(future: Pin<&mut F>) -> Option<F::Output>
where
    F: Future,
{
    let mut task = Context::from_waker(futures::task::noop_waker_ref());
    match future.poll(&mut task) {
        Poll::Ready(result) => Some(result),
        Poll::Pending => None,
    }
}
