//! The HTTP background worker. Runs outgoing requests and owns every
//! server's listening socket, accept loop and queue of pending requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use hyper::body::Incoming;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::body::{OutgoingBody, pump_incoming};
use super::error::{connect_error, hyper_request_error, hyper_response_error};
use super::fields::ForbiddenHeaders;
use super::io::TokioIo;
use super::request::OutgoingTarget;
use super::{ErrorCode, Fields, HttpError, HttpResult, Request, Response};
use crate::dispatch::{Dispatch, Operation, Router, Service};
use crate::runtime::{AbortOnDropJoinHandle, spawn, spawn_detached};
use crate::table::ResourceTable;

/// How many received requests may wait for the handler before the
/// connections delivering them are paused.
const SERVER_QUEUE_DEPTH: usize = 128;

pub(crate) static ROUTER: LazyLock<Router<HttpWorker>> =
    LazyLock::new(|| Router::new(HttpWorker::default));

/// Timeouts of one outgoing request after defaults have been applied.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) first_byte_timeout: Duration,
    pub(crate) between_bytes_timeout: Duration,
}

pub(crate) enum HttpRequest {
    ClientRequest {
        request: hyper::Request<OutgoingBody>,
        target: OutgoingTarget,
        config: ClientConfig,
        forbidden: ForbiddenHeaders,
    },
    ServerStart {
        addr: SocketAddr,
        forbidden: ForbiddenHeaders,
    },
    ServerNext {
        id: u32,
    },
    ServerResponse {
        id: u32,
        request_id: u64,
        response: hyper::Response<OutgoingBody>,
    },
    ServerStop {
        id: u32,
    },
}

impl Operation for HttpRequest {
    fn name(&self) -> &'static str {
        match self {
            HttpRequest::ClientRequest { .. } => "client-request",
            HttpRequest::ServerStart { .. } => "server-start",
            HttpRequest::ServerNext { .. } => "server-next",
            HttpRequest::ServerResponse { .. } => "server-response",
            HttpRequest::ServerStop { .. } => "server-stop",
        }
    }
}

/// A request waiting for its server's handler.
pub(crate) struct PendingRequest {
    pub(crate) id: u64,
    pub(crate) request: Request,
}

pub(crate) enum HttpResponse {
    Done,
    Response(Response),
    Started { id: u32, addr: SocketAddr },
    /// `None` once the server has stopped.
    Next(Option<PendingRequest>),
}

impl HttpResponse {
    pub(crate) fn response(self) -> HttpResult<Response> {
        match self {
            HttpResponse::Response(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn started(self) -> HttpResult<(u32, SocketAddr)> {
        match self {
            HttpResponse::Started { id, addr } => Ok((id, addr)),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn next(self) -> HttpResult<Option<PendingRequest>> {
        match self {
            HttpResponse::Next(next) => Ok(next),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(reply: &HttpResponse) -> HttpError {
    let kind = match reply {
        HttpResponse::Done => "done",
        HttpResponse::Response(_) => "response",
        HttpResponse::Started { .. } => "started",
        HttpResponse::Next(_) => "next",
    };
    HttpError::unknown(format!("unexpected http worker reply: {kind}"))
}

type Responders = Arc<Mutex<HashMap<u64, oneshot::Sender<hyper::Response<OutgoingBody>>>>>;

/// The worker side of one server.
struct ServerEntry {
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<PendingRequest>>>,
    responders: Responders,
    /// The accept loop; connections it serves are aborted along with it.
    _accept: AbortOnDropJoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct HttpWorker {
    servers: ResourceTable<ServerEntry>,
}

impl Service for HttpWorker {
    type Request = HttpRequest;
    type Response = HttpResponse;
    type Error = HttpError;
    const NAME: &'static str = "http";

    fn call(&mut self, request: HttpRequest) -> Dispatch<HttpResponse, HttpError> {
        match request {
            HttpRequest::ClientRequest {
                request,
                target,
                config,
                forbidden,
            } => Dispatch::pending(async move {
                let response = send_request(request, target, config, forbidden).await?;
                Ok(HttpResponse::Response(response))
            }),
            HttpRequest::ServerStart { addr, forbidden } => self.server_start(addr, forbidden),
            HttpRequest::ServerNext { id } => self.server_next(id),
            HttpRequest::ServerResponse {
                id,
                request_id,
                response,
            } => self.server_response(id, request_id, response).into(),
            HttpRequest::ServerStop { id } => {
                if self.servers.delete(id).is_ok() {
                    tracing::debug!(id, "server stopped");
                }
                Dispatch::Ready(Ok(HttpResponse::Done))
            }
        }
    }
}

impl HttpWorker {
    fn server_start(
        &mut self,
        addr: SocketAddr,
        forbidden: ForbiddenHeaders,
    ) -> Dispatch<HttpResponse, HttpError> {
        let listener = match std::net::TcpListener::bind(addr)
            .and_then(|l| l.set_nonblocking(true).map(|()| l))
            .and_then(TcpListener::from_std)
        {
            Ok(listener) => listener,
            Err(err) => {
                return Dispatch::Ready(Err(HttpError::with_detail(
                    ErrorCode::InternalError,
                    format!("failed to bind {addr}: {err}"),
                )));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => return Dispatch::Ready(Err(HttpError::unknown(err.to_string()))),
        };
        let (tx, rx) = mpsc::channel(SERVER_QUEUE_DEPTH);
        let responders = Responders::default();
        let accept = spawn(accept_loop(listener, tx, Arc::clone(&responders), forbidden));
        let entry = ServerEntry {
            queue: Arc::new(tokio::sync::Mutex::new(rx)),
            responders,
            _accept: accept,
        };
        let result = self.servers.push(entry).map_err(HttpError::from).map(|id| {
            tracing::debug!(id, %local_addr, "server listening");
            HttpResponse::Started {
                id,
                addr: local_addr,
            }
        });
        Dispatch::Ready(result)
    }

    fn server_next(&mut self, id: u32) -> Dispatch<HttpResponse, HttpError> {
        let queue = match self.servers.get(id) {
            Ok(entry) => Arc::clone(&entry.queue),
            Err(e) => return Dispatch::Ready(Err(e.into())),
        };
        Dispatch::pending(async move {
            let next = queue.lock().await.recv().await;
            Ok(HttpResponse::Next(next))
        })
    }

    fn server_response(
        &mut self,
        id: u32,
        request_id: u64,
        response: hyper::Response<OutgoingBody>,
    ) -> HttpResult<HttpResponse> {
        let entry = self.servers.get(id)?;
        let responder = entry
            .responders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id)
            .ok_or_else(|| {
                HttpError::with_detail(
                    ErrorCode::InvalidState,
                    format!("request {request_id} was already answered"),
                )
            })?;
        // A connection that closed in the meantime drops the response.
        let _ = responder.send(response);
        Ok(HttpResponse::Done)
    }
}

async fn accept_loop(
    listener: TcpListener,
    queue: mpsc::Sender<PendingRequest>,
    responders: Responders,
    forbidden: ForbiddenHeaders,
) {
    let next_request_id = Arc::new(AtomicU64::new(1));
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("accept failed: {err}");
                        continue;
                    }
                };
                tracing::trace!(%peer, "accepted connection");
                let queue = queue.clone();
                let responders = Arc::clone(&responders);
                let forbidden = forbidden.clone();
                let next_request_id = Arc::clone(&next_request_id);
                connections.spawn(async move {
                    let service = hyper::service::service_fn(move |req| {
                        let id = next_request_id.fetch_add(1, Ordering::Relaxed);
                        handle_incoming(
                            id,
                            req,
                            queue.clone(),
                            Arc::clone(&responders),
                            forbidden.clone(),
                        )
                    });
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .keep_alive(true)
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::warn!(%peer, "error serving connection: {err:?}");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Queues one received request and waits for the handler's response.
async fn handle_incoming(
    id: u64,
    req: hyper::Request<Incoming>,
    queue: mpsc::Sender<PendingRequest>,
    responders: Responders,
    forbidden: ForbiddenHeaders,
) -> HttpResult<hyper::Response<OutgoingBody>> {
    let (parts, body) = req.into_parts();
    let (body, trailers) = pump_incoming(body, None, forbidden.clone(), hyper_request_error);
    let request = Request::incoming(parts, &forbidden, body, trailers);
    let (tx, rx) = oneshot::channel();
    responders.lock().unwrap_or_else(PoisonError::into_inner).insert(id, tx);
    if queue.send(PendingRequest { id, request }).await.is_err() {
        responders.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        return Err(HttpError::with_detail(
            ErrorCode::ConnectionTerminated,
            "server stopped",
        ));
    }
    match rx.await {
        Ok(response) => Ok(response),
        Err(_) => {
            // The handler side went away without answering.
            let mut response = hyper::Response::new(OutgoingBody::empty());
            *response.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
            Ok(response)
        }
    }
}

/// Sends `request` over a fresh HTTP/1.1 connection and returns the
/// response head once it arrives; the body follows as a stream.
async fn send_request(
    mut request: hyper::Request<OutgoingBody>,
    OutgoingTarget {
        scheme,
        authority,
        options: _,
    }: OutgoingTarget,
    ClientConfig {
        connect_timeout,
        first_byte_timeout,
        between_bytes_timeout,
    }: ClientConfig,
    forbidden: ForbiddenHeaders,
) -> HttpResult<Response> {
    if scheme != http::uri::Scheme::HTTP {
        return Err(HttpError::with_detail(
            ErrorCode::InternalError,
            format!("unsupported scheme {scheme}"),
        ));
    }
    let connect_to = match authority.port_u16() {
        Some(_) => authority.to_string(),
        None => format!("{}:80", authority.host()),
    };
    let tcp_stream = timeout(connect_timeout, TcpStream::connect(&connect_to))
        .await
        .map_err(|_| ErrorCode::ConnectionTimeout)?
        .map_err(connect_error)?;

    let (mut sender, conn) = timeout(
        connect_timeout,
        hyper::client::conn::http1::handshake(TokioIo::new(tcp_stream)),
    )
    .await
    .map_err(|_| ErrorCode::ConnectionTimeout)?
    .map_err(hyper_request_error)?;

    spawn_detached(async move {
        if let Err(e) = conn.await {
            tracing::warn!("dropping error {e}");
        }
    });

    if let Ok(host) = http::HeaderValue::from_str(authority.as_str()) {
        request.headers_mut().insert(http::header::HOST, host);
    }

    let response = timeout(first_byte_timeout, sender.send_request(request))
        .await
        .map_err(|_| ErrorCode::ConnectionReadTimeout)?
        .map_err(hyper_request_error)?;

    let (parts, body) = response.into_parts();
    let headers = Fields::from_header_map(parts.headers, &forbidden);
    let (body, trailers) = pump_incoming(
        body,
        Some(between_bytes_timeout),
        forbidden,
        hyper_response_error,
    );
    Ok(Response::incoming(parts.status, headers, body, trailers))
}
