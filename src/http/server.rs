use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinSet;

use super::body::OutgoingBody;
use super::worker::{HttpRequest, HttpResponse, PendingRequest, ROUTER};
use super::{HttpResult, Request, Response};
use crate::ctx::ShimCtx;
use crate::runtime::{AbortOnDropJoinHandle, spawn};

/// Produces the response to one incoming request.
///
/// An error or a panic is answered with a bodyless `500 Internal Server
/// Error`; the server keeps running.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> anyhow::Result<Response>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> anyhow::Result<Response> {
        (self)(request).await
    }
}

/// An HTTP/1.1 server handing every request to a [`Handler`].
///
/// The listening socket is owned by the HTTP worker; this front end pulls
/// requests from it one at a time and runs handlers concurrently.
pub struct HttpServer {
    id: u32,
    local_addr: SocketAddr,
    serve: Option<AbortOnDropJoinHandle<()>>,
}

impl HttpServer {
    /// Starts listening on `addr`, which may use port 0.
    pub async fn new(ctx: &ShimCtx, addr: SocketAddr, handler: impl Handler) -> HttpResult<Self> {
        let (id, local_addr) = ROUTER
            .submit(HttpRequest::ServerStart {
                addr,
                forbidden: ctx.forbidden_headers().clone(),
            })
            .await?
            .started()?;
        let serve = spawn(serve(id, Arc::new(handler)));
        Ok(HttpServer {
            id,
            local_addr,
            serve: Some(serve),
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting requests and releases the listening socket.
    ///
    /// Requests still being handled are abandoned. Only the first call has
    /// any effect.
    pub fn stop(&mut self) {
        if let Some(serve) = self.serve.take() {
            drop(serve);
            ROUTER.post(HttpRequest::ServerStop { id: self.id });
            tracing::debug!(id = self.id, "stopping server");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.serve.is_none()
    }

    /// Stops the server and disposes of it.
    pub fn close(mut self) {
        self.stop();
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if !self.is_stopped() {
            tracing::debug!(id = self.id, "server dropped without being stopped");
            self.stop();
        }
    }
}

async fn serve(server: u32, handler: Arc<dyn Handler>) {
    let mut handlers = JoinSet::new();
    loop {
        // Held across iterations: dropping it would lose the request it
        // resolves with.
        let next = ROUTER.submit(HttpRequest::ServerNext { id: server });
        tokio::pin!(next);
        let next = loop {
            tokio::select! {
                next = &mut next => break next,
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(err) = joined {
                        tracing::warn!(server, "handler task failed: {err}");
                    }
                }
            }
        };
        match next.and_then(HttpResponse::next) {
            Ok(Some(PendingRequest { id, request })) => {
                handlers.spawn(respond(server, id, Arc::clone(&handler), request));
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(server, "server loop stopped: {err}");
                break;
            }
        }
    }
    while handlers.join_next().await.is_some() {}
}

async fn respond(server: u32, request_id: u64, handler: Arc<dyn Handler>, request: Request) {
    let outcome = AssertUnwindSafe(handler.handle(request))
        .catch_unwind()
        .await;
    let response = match outcome {
        Ok(Ok(response)) => match response.into_outgoing() {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(server, request_id, "handler returned an unusable response: {err}");
                internal_error()
            }
        },
        Ok(Err(err)) => {
            tracing::warn!(server, request_id, "handler failed: {err:?}");
            internal_error()
        }
        Err(_) => {
            tracing::warn!(server, request_id, "handler panicked");
            internal_error()
        }
    };
    let sent = ROUTER
        .submit(HttpRequest::ServerResponse {
            id: server,
            request_id,
            response,
        })
        .await;
    if let Err(err) = sent {
        tracing::debug!(server, request_id, "response not delivered: {err}");
    }
}

fn internal_error() -> hyper::Response<OutgoingBody> {
    let mut response = hyper::Response::new(OutgoingBody::empty());
    *response.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
    response
}
