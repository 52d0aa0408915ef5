//! The TCP background worker. Owns every OS-level TCP socket; front ends
//! refer to them by handle.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use io_lifetimes::AsSocketlike as _;
use io_lifetimes::views::SocketlikeView;
use rustix::io::Errno;
use rustix::net::sockopt;

use super::tcp::TcpSocket;
use super::util::{
    get_unicast_hop_limit, receive_buffer_size, send_buffer_size, set_keep_alive_count,
    set_keep_alive_idle_time, set_keep_alive_interval, set_receive_buffer_size,
    set_send_buffer_size, set_unicast_hop_limit, tcp_bind,
};
use super::{ErrorCode, SocketAddrCheck, SocketAddressFamily, SocketError, SocketOption, SocketResult};
use crate::dispatch::{Dispatch, Operation, Router, Service};
use crate::future::FutureWriter;
use crate::runtime::{AbortOnDropJoinHandle, spawn};
use crate::stream::{StreamError, StreamReader, StreamWriter};
use crate::table::ResourceTable;

/// Size of the buffer each receive iteration fills.
const RECEIVE_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) static ROUTER: LazyLock<Router<TcpWorker>> =
    LazyLock::new(|| Router::new(TcpWorker::default));

pub(crate) enum TcpRequest {
    Create {
        family: SocketAddressFamily,
    },
    Bind {
        id: u32,
        addr: SocketAddr,
    },
    Connect {
        id: u32,
        addr: SocketAddr,
    },
    Listen {
        id: u32,
        backlog: u32,
        check: SocketAddrCheck,
        stream: StreamWriter<TcpSocket>,
    },
    Send {
        id: u32,
        data: StreamReader<Bytes>,
        done: FutureWriter<(), SocketError>,
    },
    Receive {
        id: u32,
        stream: StreamWriter<Bytes>,
        done: FutureWriter<(), SocketError>,
    },
    LocalAddress {
        id: u32,
    },
    RemoteAddress {
        id: u32,
    },
    SetListenBacklog {
        id: u32,
        value: u32,
    },
    GetOption {
        id: u32,
        option: SocketOption,
    },
    SetOption {
        id: u32,
        option: SocketOption,
        value: u64,
    },
    Dispose {
        id: u32,
    },
}

impl Operation for TcpRequest {
    fn name(&self) -> &'static str {
        match self {
            TcpRequest::Create { .. } => "create",
            TcpRequest::Bind { .. } => "bind",
            TcpRequest::Connect { .. } => "connect",
            TcpRequest::Listen { .. } => "listen",
            TcpRequest::Send { .. } => "send",
            TcpRequest::Receive { .. } => "receive",
            TcpRequest::LocalAddress { .. } => "getLocalAddress",
            TcpRequest::RemoteAddress { .. } => "getRemoteAddress",
            TcpRequest::SetListenBacklog { .. } => "setListenBacklog",
            TcpRequest::GetOption { .. } => "getOption",
            TcpRequest::SetOption { .. } => "setOption",
            TcpRequest::Dispose { .. } => "dispose",
        }
    }
}

#[derive(Debug)]
pub(crate) enum TcpResponse {
    Done,
    Created(u32),
    Address(SocketAddr),
    Value(u64),
}

impl TcpResponse {
    pub(crate) fn created(self) -> SocketResult<u32> {
        match self {
            TcpResponse::Created(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) fn address(self) -> SocketResult<SocketAddr> {
        match self {
            TcpResponse::Address(addr) => Ok(addr),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) fn value(self) -> SocketResult<u64> {
        match self {
            TcpResponse::Value(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: TcpResponse) -> SocketError {
    SocketError::unknown(format!("unexpected tcp worker reply: {reply:?}"))
}

/// The OS side of one socket.
enum Socket {
    Unbound(tokio::net::TcpSocket),
    Bound(tokio::net::TcpSocket),
    Listening(Arc<tokio::net::TcpListener>),
    Connecting,
    Connected(Arc<tokio::net::TcpStream>),
    Closed,
}

struct TcpEntry {
    socket: Socket,
    family: SocketAddressFamily,
    /// Accept, send and receive loops; aborted when the entry is disposed.
    tasks: Vec<AbortOnDropJoinHandle<()>>,
}

impl TcpEntry {
    fn new(socket: Socket, family: SocketAddressFamily) -> Self {
        TcpEntry {
            socket,
            family,
            tasks: Vec::new(),
        }
    }

    fn as_std_view(&self) -> SocketResult<SocketlikeView<'_, std::net::TcpStream>> {
        match &self.socket {
            Socket::Unbound(socket) | Socket::Bound(socket) => Ok(socket.as_socketlike_view()),
            Socket::Listening(listener) => Ok(listener.as_socketlike_view()),
            Socket::Connected(stream) => Ok(stream.as_socketlike_view()),
            Socket::Connecting | Socket::Closed => Err(ErrorCode::InvalidState.into()),
        }
    }

    fn stream(&self) -> SocketResult<Arc<tokio::net::TcpStream>> {
        match &self.socket {
            Socket::Connected(stream) => Ok(Arc::clone(stream)),
            _ => Err(ErrorCode::InvalidState.into()),
        }
    }
}

type Table = Arc<Mutex<ResourceTable<TcpEntry>>>;

#[derive(Default)]
pub(crate) struct TcpWorker {
    table: Table,
}

impl Service for TcpWorker {
    type Request = TcpRequest;
    type Response = TcpResponse;
    type Error = SocketError;
    const NAME: &'static str = "tcp";

    fn call(&mut self, request: TcpRequest) -> Dispatch<TcpResponse, SocketError> {
        match request {
            TcpRequest::Create { family } => self.create(family).into(),
            TcpRequest::Bind { id, addr } => self.bind(id, addr).into(),
            TcpRequest::Connect { id, addr } => self.connect(id, addr),
            TcpRequest::Listen {
                id,
                backlog,
                check,
                stream,
            } => self.listen(id, backlog, check, stream).into(),
            TcpRequest::Send { id, data, done } => {
                self.start(id, done, |stream| send(stream, data));
                Dispatch::Ready(Ok(TcpResponse::Done))
            }
            TcpRequest::Receive { id, stream, done } => {
                self.start(id, done, |s| receive(s, stream));
                Dispatch::Ready(Ok(TcpResponse::Done))
            }
            TcpRequest::LocalAddress { id } => self.local_address(id).into(),
            TcpRequest::RemoteAddress { id } => self.remote_address(id).into(),
            TcpRequest::SetListenBacklog { id, value } => self.set_listen_backlog(id, value).into(),
            TcpRequest::GetOption { id, option } => self.get_option(id, option).into(),
            TcpRequest::SetOption { id, option, value } => {
                self.set_option(id, option, value).into()
            }
            TcpRequest::Dispose { id } => {
                // Dropping the entry aborts its loops and closes the socket.
                let _ = self.table.lock().unwrap_or_else(PoisonError::into_inner).delete(id);
                Dispatch::Ready(Ok(TcpResponse::Done))
            }
        }
    }
}

impl TcpWorker {
    fn create(&mut self, family: SocketAddressFamily) -> SocketResult<TcpResponse> {
        let socket = match family {
            SocketAddressFamily::Ipv4 => tokio::net::TcpSocket::new_v4()?,
            SocketAddressFamily::Ipv6 => {
                let socket = tokio::net::TcpSocket::new_v6()?;
                sockopt::set_ipv6_v6only(&socket, true)?;
                socket
            }
        };
        let id = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TcpEntry::new(Socket::Unbound(socket), family))?;
        Ok(TcpResponse::Created(id))
    }

    fn bind(&mut self, id: u32, addr: SocketAddr) -> SocketResult<TcpResponse> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = table.get_mut(id)?;
        match std::mem::replace(&mut entry.socket, Socket::Closed) {
            Socket::Unbound(socket) => {
                let res = tcp_bind(&socket, addr);
                entry.socket = match res {
                    Ok(()) => Socket::Bound(socket),
                    Err(_) => Socket::Unbound(socket),
                };
                res.map(|()| TcpResponse::Done)
            }
            other => {
                entry.socket = other;
                Err(ErrorCode::InvalidState.into())
            }
        }
    }

    fn connect(&mut self, id: u32, addr: SocketAddr) -> Dispatch<TcpResponse, SocketError> {
        let socket = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = match table.get_mut(id) {
                Ok(entry) => entry,
                Err(e) => return Dispatch::Ready(Err(e.into())),
            };
            match std::mem::replace(&mut entry.socket, Socket::Connecting) {
                Socket::Unbound(socket) | Socket::Bound(socket) => socket,
                other => {
                    entry.socket = other;
                    return Dispatch::Ready(Err(ErrorCode::InvalidState.into()));
                }
            }
        };
        let table = Arc::clone(&self.table);
        Dispatch::pending(async move {
            let res = socket.connect(addr).await;
            let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = table.get_mut(id)?;
            match res {
                Ok(stream) => {
                    entry.socket = Socket::Connected(Arc::new(stream));
                    Ok(TcpResponse::Done)
                }
                Err(err) => {
                    entry.socket = Socket::Closed;
                    Err(match Errno::from_io_error(&err) {
                        Some(Errno::AFNOSUPPORT) => ErrorCode::InvalidArgument.into(),
                        _ => err.into(),
                    })
                }
            }
        })
    }

    fn listen(
        &mut self,
        id: u32,
        backlog: u32,
        check: SocketAddrCheck,
        mut stream: StreamWriter<TcpSocket>,
    ) -> SocketResult<TcpResponse> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = table.get_mut(id)?;
        let family = entry.family;
        match &entry.socket {
            Socket::Unbound(socket) | Socket::Bound(socket) => {
                rustix::net::listen(socket, i32::try_from(backlog).unwrap_or(i32::MAX))?;
            }
            _ => return Err(ErrorCode::InvalidState.into()),
        }
        let listener = match std::mem::replace(&mut entry.socket, Socket::Closed) {
            // Already listening; only registering with the reactor remains.
            Socket::Unbound(socket) | Socket::Bound(socket) => Arc::new(socket.listen(backlog)?),
            other => {
                entry.socket = other;
                return Err(ErrorCode::InvalidState.into());
            }
        };
        entry.socket = Socket::Listening(Arc::clone(&listener));
        let accepted_into = Arc::clone(&self.table);
        let task = spawn(async move {
            loop {
                let connection = tokio::select! {
                    res = listener.accept() => res,
                    () = stream.closed() => return,
                };
                let tcp_stream = match connection {
                    Ok((tcp_stream, _peer)) => tcp_stream,
                    Err(err) => {
                        tracing::debug!(id, "accept failed: {err}");
                        stream.abort(SocketError::from(err));
                        return;
                    }
                };
                let pushed = accepted_into
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(TcpEntry::new(Socket::Connected(Arc::new(tcp_stream)), family));
                let accepted_id = match pushed {
                    Ok(accepted_id) => accepted_id,
                    Err(err) => {
                        stream.abort(SocketError::from(err));
                        return;
                    }
                };
                let socket = TcpSocket::accepted(accepted_id, family, check.clone());
                // A reader that went away drops the socket, which disposes it.
                if stream.write(socket).await.is_err() {
                    return;
                }
            }
        });
        entry.tasks.push(task);
        Ok(TcpResponse::Done)
    }

    /// Starts a send or receive loop over the connected stream of `id`,
    /// settling `done` with its outcome.
    fn start<F, Fut>(&mut self, id: u32, done: FutureWriter<(), SocketError>, body: F)
    where
        F: FnOnce(Arc<tokio::net::TcpStream>) -> Fut,
        Fut: std::future::Future<Output = SocketResult<()>> + Send + 'static,
    {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = match table.get_mut(id) {
            Ok(entry) => entry,
            Err(e) => return done.reject(e.into()),
        };
        let stream = match entry.stream() {
            Ok(stream) => stream,
            Err(e) => return done.reject(e),
        };
        let fut = body(stream);
        entry.tasks.push(spawn(async move { done.settle(fut.await) }));
    }

    fn local_address(&self, id: u32) -> SocketResult<TcpResponse> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = table.get(id)?;
        let addr = match &entry.socket {
            Socket::Bound(socket) => socket.local_addr()?,
            Socket::Listening(listener) => listener.local_addr()?,
            Socket::Connected(stream) => stream.local_addr()?,
            _ => return Err(ErrorCode::InvalidState.into()),
        };
        Ok(TcpResponse::Address(addr))
    }

    fn remote_address(&self, id: u32) -> SocketResult<TcpResponse> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let addr = table.get(id)?.stream()?.peer_addr()?;
        Ok(TcpResponse::Address(addr))
    }

    fn set_listen_backlog(&self, id: u32, value: u32) -> SocketResult<TcpResponse> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        match &table.get(id)?.socket {
            Socket::Listening(listener) => {
                // Try to update the backlog by calling `listen` again. Not all
                // platforms support this.
                rustix::net::listen(&**listener, i32::try_from(value).unwrap_or(i32::MAX))
                    .map_err(|_| SocketError::new(ErrorCode::NotSupported))?;
                Ok(TcpResponse::Done)
            }
            _ => Err(ErrorCode::InvalidState.into()),
        }
    }

    fn get_option(&self, id: u32, option: SocketOption) -> SocketResult<TcpResponse> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = table.get(id)?;
        let fd = &*entry.as_std_view()?;
        let nanos = |d: std::time::Duration| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        let value = match option {
            SocketOption::KeepAliveEnabled => u64::from(sockopt::socket_keepalive(fd)?),
            SocketOption::KeepAliveIdleTime => nanos(sockopt::tcp_keepidle(fd)?),
            SocketOption::KeepAliveInterval => nanos(sockopt::tcp_keepintvl(fd)?),
            SocketOption::KeepAliveCount => u64::from(sockopt::tcp_keepcnt(fd)?),
            SocketOption::HopLimit => u64::from(get_unicast_hop_limit(fd, entry.family)?),
            SocketOption::ReceiveBufferSize => receive_buffer_size(fd)?,
            SocketOption::SendBufferSize => send_buffer_size(fd)?,
        };
        Ok(TcpResponse::Value(value))
    }

    /// Applies an option and replies with the value actually applied after
    /// clamping.
    fn set_option(&self, id: u32, option: SocketOption, value: u64) -> SocketResult<TcpResponse> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = table.get(id)?;
        let fd = &*entry.as_std_view()?;
        let applied = match option {
            SocketOption::KeepAliveEnabled => {
                sockopt::set_socket_keepalive(fd, value != 0)?;
                value
            }
            SocketOption::KeepAliveIdleTime => set_keep_alive_idle_time(fd, value)?,
            SocketOption::KeepAliveInterval => set_keep_alive_interval(fd, value)?,
            SocketOption::KeepAliveCount => {
                let count = u32::try_from(value).unwrap_or(u32::MAX);
                u64::from(set_keep_alive_count(fd, count)?)
            }
            SocketOption::HopLimit => {
                let hops = u8::try_from(value)
                    .map_err(|_| SocketError::new(ErrorCode::InvalidArgument))?;
                set_unicast_hop_limit(fd, entry.family, hops)?;
                value
            }
            SocketOption::ReceiveBufferSize => set_receive_buffer_size(fd, value)?,
            SocketOption::SendBufferSize => set_send_buffer_size(fd, value)?,
        };
        Ok(TcpResponse::Value(applied))
    }
}

fn stream_error(err: StreamError) -> SocketError {
    if let Some(err) = err.downcast_ref::<SocketError>() {
        return err.clone();
    }
    SocketError::from(io::Error::from(err))
}

/// Drains `data` into the connection, then shuts down its write half.
async fn send(stream: Arc<tokio::net::TcpStream>, mut data: StreamReader<Bytes>) -> SocketResult<()> {
    loop {
        let chunk = match data.read().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => return Err(stream_error(err)),
        };
        let mut buf = &chunk[..];
        while !buf.is_empty() {
            stream.writable().await?;
            match stream.try_write(buf) {
                Ok(n) => buf = &buf[n..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
    stream
        .as_socketlike_view::<std::net::TcpStream>()
        .shutdown(Shutdown::Write)?;
    Ok(())
}

/// Feeds everything read from the connection into `tx` until end of file.
async fn receive(
    stream: Arc<tokio::net::TcpStream>,
    mut tx: StreamWriter<Bytes>,
) -> SocketResult<()> {
    let mut buf = BytesMut::with_capacity(RECEIVE_CHUNK_SIZE);
    loop {
        buf.reserve(RECEIVE_CHUNK_SIZE);
        let n = loop {
            let ready = tokio::select! {
                res = stream.readable() => res,
                () = tx.closed() => {
                    // Reader went away; stop receiving.
                    let _ = stream
                        .as_socketlike_view::<std::net::TcpStream>()
                        .shutdown(Shutdown::Read);
                    return Ok(());
                }
            };
            let res = ready.and_then(|()| stream.try_read_buf(&mut buf));
            match res {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => {
                    let err = SocketError::from(err);
                    tx.abort(err.clone());
                    return Err(err);
                }
            }
        };
        if n == 0 {
            tx.close();
            return Ok(());
        }
        if tx.write(buf.split().freeze()).await.is_err() {
            return Ok(());
        }
    }
}
