//! Request/response plumbing between front-end resources and the background
//! workers that perform blocking OS work.
//!
//! Each subsystem implements [`Service`] and owns one process-wide
//! [`Router`]. The router lazily spawns a dedicated thread running a
//! current-thread tokio runtime, tags each submitted request with a fresh
//! correlation id and routes the worker's reply back to the caller that is
//! waiting on that id. Requests are handed to [`Service::call`] in the order
//! they were submitted; operations that need to wait on I/O return a future
//! which the worker drives concurrently with later requests.
//!
//! If the worker thread dies, every outstanding correlation is rejected with
//! [`WorkerTerminated`] and the next submission spawns a fresh worker.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::{fmt, mem, thread};
use tokio::sync::{mpsc, oneshot};

/// A request message understood by some [`Service`].
pub trait Operation {
    /// The operation name used in diagnostics.
    fn name(&self) -> &'static str;
}

/// The handler side of a background worker.
pub trait Service: Send + 'static {
    type Request: Operation + Send + 'static;
    type Response: Send + 'static;
    type Error: From<WorkerTerminated> + fmt::Debug + Send + 'static;

    /// Subsystem name, used for thread names and diagnostics.
    const NAME: &'static str;

    /// Handle one request.
    ///
    /// Called on the worker thread, inside its tokio runtime, strictly in
    /// submission order.
    fn call(&mut self, request: Self::Request) -> Dispatch<Self::Response, Self::Error>;
}

/// The outcome of [`Service::call`].
pub enum Dispatch<R, E> {
    /// The operation finished synchronously.
    Ready(Result<R, E>),
    /// The operation finishes when the future does.
    Pending(BoxFuture<'static, Result<R, E>>),
}

impl<R, E> Dispatch<R, E> {
    pub fn pending(future: impl Future<Output = Result<R, E>> + Send + 'static) -> Self {
        Dispatch::Pending(Box::pin(future))
    }
}

impl<R, E> From<Result<R, E>> for Dispatch<R, E> {
    fn from(result: Result<R, E>) -> Self {
        Dispatch::Ready(result)
    }
}

/// The background worker of a subsystem stopped before replying.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{subsystem} worker terminated: {reason}")]
pub struct WorkerTerminated {
    subsystem: &'static str,
    reason: String,
}

impl WorkerTerminated {
    pub fn new(subsystem: &'static str, reason: impl Into<String>) -> Self {
        Self {
            subsystem,
            reason: reason.into(),
        }
    }

    pub fn subsystem(&self) -> &'static str {
        self.subsystem
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

type Reply<S> = Result<<S as Service>::Response, <S as Service>::Error>;

struct Envelope<S: Service> {
    id: u64,
    request: S::Request,
}

enum Waiter<T> {
    Async(oneshot::Sender<T>),
    Blocking(std::sync::mpsc::SyncSender<T>),
    Detached,
}

impl<T> Waiter<T> {
    fn complete(self, value: T) {
        match self {
            Waiter::Async(tx) => {
                let _ = tx.send(value);
            }
            Waiter::Blocking(tx) => {
                let _ = tx.send(value);
            }
            Waiter::Detached => {}
        }
    }
}

struct Pending<S: Service> {
    terminated: bool,
    waiters: HashMap<u64, Waiter<Reply<S>>>,
}

/// One live worker thread plus the callers waiting on it.
struct Unit<S: Service> {
    tx: mpsc::UnboundedSender<Envelope<S>>,
    pending: Arc<Mutex<Pending<S>>>,
}

impl<S: Service> Unit<S> {
    fn spawn(service: S, generation: u64) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(Pending {
            terminated: false,
            waiters: HashMap::new(),
        }));
        let shared = Arc::clone(&pending);
        thread::Builder::new()
            .name(format!("{}-worker", S::NAME))
            .spawn(move || {
                let span = tracing::info_span!("worker", subsystem = S::NAME, generation);
                let _enter = span.enter();
                tracing::debug!("background worker started");
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()?;
                    rt.block_on(run(service, rx, Arc::clone(&shared)));
                    Ok::<_, std::io::Error>(())
                }));
                let reason = match outcome {
                    Ok(Ok(())) => "worker shut down".to_string(),
                    Ok(Err(e)) => format!("failed to start runtime: {e}"),
                    Err(payload) => panic_message(payload.as_ref()),
                };
                terminate::<S>(&shared, reason);
            })?;
        Ok(Unit { tx, pending })
    }

    fn is_terminated(&self) -> bool {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).terminated
    }
}

async fn run<S: Service>(
    mut service: S,
    mut rx: mpsc::UnboundedReceiver<Envelope<S>>,
    pending: Arc<Mutex<Pending<S>>>,
) {
    let mut in_flight = FuturesUnordered::new();
    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(Envelope { id, request }) = envelope else {
                    break;
                };
                tracing::trace!(id, op = request.name(), "dispatching");
                match service.call(request) {
                    Dispatch::Ready(result) => reply::<S>(&pending, id, result),
                    Dispatch::Pending(future) => in_flight.push(async move { (id, future.await) }),
                }
            }
            Some((id, result)) = in_flight.next(), if !in_flight.is_empty() => {
                reply::<S>(&pending, id, result);
            }
        }
    }
}

fn reply<S: Service>(pending: &Mutex<Pending<S>>, id: u64, result: Reply<S>) {
    let waiter = pending.lock().unwrap_or_else(PoisonError::into_inner).waiters.remove(&id);
    match waiter {
        Some(waiter) => waiter.complete(result),
        None => tracing::debug!(id, "dropping reply for unknown correlation id"),
    }
}

fn terminate<S: Service>(pending: &Mutex<Pending<S>>, reason: String) {
    let waiters = {
        let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.terminated = true;
        mem::take(&mut pending.waiters)
    };
    if waiters.is_empty() {
        tracing::debug!(%reason, "background worker stopped");
    } else {
        tracing::warn!(
            %reason,
            outstanding = waiters.len(),
            "background worker terminated with calls in flight"
        );
    }
    for (_, waiter) in waiters {
        waiter.complete(Err(WorkerTerminated::new(S::NAME, reason.clone()).into()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

/// The front end of a subsystem's background worker.
pub struct Router<S: Service> {
    factory: Box<dyn Fn() -> S + Send + Sync>,
    unit: Mutex<Option<Arc<Unit<S>>>>,
    next_id: AtomicU64,
    generation: AtomicU64,
}

impl<S: Service> Router<S> {
    /// Creates a router whose workers are built by `factory`.
    ///
    /// No thread is started until the first submission.
    pub fn new(factory: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            unit: Mutex::new(None),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of worker threads spawned so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn unit(&self) -> Result<Arc<Unit<S>>, WorkerTerminated> {
        let mut unit = self.unit.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(live) = unit.as_ref().filter(|u| !u.is_terminated()) {
            return Ok(Arc::clone(live));
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        if generation > 1 {
            tracing::debug!(subsystem = S::NAME, generation, "respawning background worker");
        }
        let fresh = Arc::new(
            Unit::spawn((self.factory)(), generation)
                .map_err(|e| WorkerTerminated::new(S::NAME, format!("failed to spawn: {e}")))?,
        );
        *unit = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    fn send(&self, request: S::Request, waiter: Waiter<Reply<S>>) {
        loop {
            let unit = match self.unit() {
                Ok(unit) => unit,
                Err(e) => return waiter.complete(Err(e.into())),
            };
            let id = {
                let mut pending = unit.pending.lock().unwrap_or_else(PoisonError::into_inner);
                if pending.terminated {
                    continue;
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                pending.waiters.insert(id, waiter);
                id
            };
            // A failed send means the worker is going away; its termination
            // sweep rejects the waiter registered above.
            let _ = unit.tx.send(Envelope { id, request });
            return;
        }
    }

    /// Submits `request` and resolves with the correlated reply.
    ///
    /// The request is enqueued before this returns, so requests are
    /// processed in call order regardless of when the futures are polled.
    pub fn submit(
        &self,
        request: S::Request,
    ) -> impl Future<Output = Result<S::Response, S::Error>> + Send + 'static + use<S> {
        let (tx, rx) = oneshot::channel();
        self.send(request, Waiter::Async(tx));
        async move {
            rx.await.unwrap_or_else(|_| {
                Err(WorkerTerminated::new(S::NAME, "reply channel closed").into())
            })
        }
    }

    /// Like [`Router::submit`], but blocks the calling thread until the
    /// reply arrives.
    ///
    /// Safe to call from async code since the worker never depends on the
    /// caller's executor, but it must not be called from the worker itself.
    pub fn submit_blocking(&self, request: S::Request) -> Result<S::Response, S::Error> {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.send(request, Waiter::Blocking(tx));
        rx.recv().unwrap_or_else(|_| {
            Err(WorkerTerminated::new(S::NAME, "reply channel closed").into())
        })
    }

    /// Submits `request` without waiting for, or caring about, the reply.
    pub fn post(&self, request: S::Request) {
        self.send(request, Waiter::Detached);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug)]
    enum Request {
        Echo(u32),
        Delayed(Duration, u32),
        Next,
        Fail,
        Crash,
    }

    impl Operation for Request {
        fn name(&self) -> &'static str {
            match self {
                Request::Echo(_) => "echo",
                Request::Delayed(..) => "delayed",
                Request::Next => "next",
                Request::Fail => "fail",
                Request::Crash => "crash",
            }
        }
    }

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed,
        Terminated(String),
    }

    impl From<WorkerTerminated> for TestError {
        fn from(e: WorkerTerminated) -> Self {
            TestError::Terminated(e.reason().to_string())
        }
    }

    #[derive(Default)]
    struct Counter {
        next: u32,
    }

    impl Service for Counter {
        type Request = Request;
        type Response = u32;
        type Error = TestError;
        const NAME: &'static str = "test";

        fn call(&mut self, request: Request) -> Dispatch<u32, TestError> {
            match request {
                Request::Echo(v) => Dispatch::Ready(Ok(v)),
                Request::Delayed(d, v) => Dispatch::pending(async move {
                    tokio::time::sleep(d).await;
                    Ok(v)
                }),
                Request::Next => {
                    self.next += 1;
                    Dispatch::Ready(Ok(self.next))
                }
                Request::Fail => Dispatch::Ready(Err(TestError::Failed)),
                Request::Crash => panic!("requested crash"),
            }
        }
    }

    #[tokio::test]
    async fn replies_are_correlated() {
        let router = Router::new(Counter::default);
        let slow = router.submit(Request::Delayed(Duration::from_millis(100), 1));
        let fast = router.submit(Request::Echo(2));
        assert_eq!(fast.await, Ok(2));
        assert_eq!(slow.await, Ok(1));
    }

    #[tokio::test]
    async fn a_poisoned_router_keeps_dispatching() {
        let router = Arc::new(Router::new(Counter::default));
        assert_eq!(router.submit(Request::Echo(1)).await, Ok(1));
        let holder = Arc::clone(&router);
        let _ = std::thread::spawn(move || {
            let _guard = holder.unit.lock().unwrap();
            panic!("panicked while holding the worker slot");
        })
        .join();
        assert!(router.unit.is_poisoned());
        assert_eq!(router.submit(Request::Echo(2)).await, Ok(2));
        assert_eq!(router.generation(), 1);
    }

    #[tokio::test]
    async fn requests_are_handled_in_submission_order() {
        let router = Router::new(Counter::default);
        let calls: Vec<_> = (0..50).map(|_| router.submit(Request::Next)).collect();
        // Await in reverse to show that polling order does not matter.
        let mut results = Vec::new();
        for call in calls.into_iter().rev() {
            results.push(call.await.unwrap());
        }
        results.reverse();
        assert_eq!(results, (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn handler_errors_are_returned_to_the_caller() {
        let router = Router::new(Counter::default);
        assert_eq!(router.submit(Request::Fail).await, Err(TestError::Failed));
        assert_eq!(router.submit(Request::Echo(7)).await, Ok(7));
        assert_eq!(router.generation(), 1);
    }

    #[tokio::test]
    async fn crash_rejects_outstanding_calls_and_respawns() {
        let router = Router::new(Counter::default);
        assert_eq!(router.submit(Request::Next).await, Ok(1));
        let stuck = router.submit(Request::Delayed(Duration::from_secs(60), 0));
        let crash = router.submit(Request::Crash);

        match stuck.await {
            Err(TestError::Terminated(reason)) => assert!(reason.contains("requested crash")),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(matches!(crash.await, Err(TestError::Terminated(_))));

        // A fresh worker with fresh state takes over.
        assert_eq!(router.submit(Request::Next).await, Ok(1));
        assert_eq!(router.generation(), 2);
    }

    #[test]
    fn blocking_submission() {
        let router = Router::new(Counter::default);
        assert_eq!(router.submit_blocking(Request::Echo(3)), Ok(3));
        router.post(Request::Next);
        assert_eq!(router.submit_blocking(Request::Next), Ok(2));
    }

    #[tokio::test]
    async fn blocking_submission_from_async_context() {
        let router = Router::new(Counter::default);
        assert_eq!(
            router.submit_blocking(Request::Delayed(Duration::from_millis(10), 4)),
            Ok(4)
        );
    }
}
