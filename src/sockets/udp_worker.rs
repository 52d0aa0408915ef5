//! The UDP background worker.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use bytes::Bytes;
use rustix::io::Errno;
use rustix::net::sockopt;
use tokio::sync::watch;

use super::udp::Datagram;
use super::util::{
    get_unicast_hop_limit, receive_buffer_size, send_buffer_size, set_receive_buffer_size,
    set_send_buffer_size, set_unicast_hop_limit, udp_bind, udp_disconnect, udp_socket,
};
use super::{
    ErrorCode, IpAddressFamily, MAX_UDP_DATAGRAM_SIZE, SocketAddressFamily, SocketError,
    SocketOption, SocketResult,
};
use crate::dispatch::{Dispatch, Operation, Router, Service};
use crate::table::ResourceTable;

pub(crate) static ROUTER: LazyLock<Router<UdpWorker>> =
    LazyLock::new(|| Router::new(UdpWorker::default));

#[derive(Debug)]
pub(crate) enum UdpRequest {
    Create { family: SocketAddressFamily },
    Bind { id: u32, addr: SocketAddr },
    Connect { id: u32, addr: SocketAddr },
    Disconnect { id: u32 },
    Send {
        id: u32,
        data: Bytes,
        addr: Option<SocketAddr>,
    },
    Receive { id: u32 },
    LocalAddress { id: u32 },
    RemoteAddress { id: u32 },
    GetOption { id: u32, option: SocketOption },
    SetOption {
        id: u32,
        option: SocketOption,
        value: u64,
    },
    Dispose { id: u32 },
}

impl Operation for UdpRequest {
    fn name(&self) -> &'static str {
        match self {
            UdpRequest::Create { .. } => "create",
            UdpRequest::Bind { .. } => "bind",
            UdpRequest::Connect { .. } => "connect",
            UdpRequest::Disconnect { .. } => "disconnect",
            UdpRequest::Send { .. } => "send",
            UdpRequest::Receive { .. } => "receive",
            UdpRequest::LocalAddress { .. } => "getLocalAddress",
            UdpRequest::RemoteAddress { .. } => "getRemoteAddress",
            UdpRequest::GetOption { .. } => "getOption",
            UdpRequest::SetOption { .. } => "setOption",
            UdpRequest::Dispose { .. } => "dispose",
        }
    }
}

#[derive(Debug)]
pub(crate) enum UdpResponse {
    Done,
    Created(u32),
    Address(SocketAddr),
    Value(u64),
    Datagram(Datagram),
}

impl UdpResponse {
    pub(crate) fn created(self) -> SocketResult<u32> {
        match self {
            UdpResponse::Created(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) fn address(self) -> SocketResult<SocketAddr> {
        match self {
            UdpResponse::Address(addr) => Ok(addr),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) fn value(self) -> SocketResult<u64> {
        match self {
            UdpResponse::Value(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) fn datagram(self) -> SocketResult<Datagram> {
        match self {
            UdpResponse::Datagram(d) => Ok(d),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: UdpResponse) -> SocketError {
    SocketError::unknown(format!("unexpected udp worker reply: {reply:?}"))
}

struct UdpEntry {
    socket: Arc<tokio::net::UdpSocket>,
    family: SocketAddressFamily,
    /// Dropped with the entry; wakes up in-flight sends and receives.
    disposed: watch::Sender<()>,
}

#[derive(Default)]
pub(crate) struct UdpWorker {
    table: Arc<Mutex<ResourceTable<UdpEntry>>>,
}

impl Service for UdpWorker {
    type Request = UdpRequest;
    type Response = UdpResponse;
    type Error = SocketError;
    const NAME: &'static str = "udp";

    fn call(&mut self, request: UdpRequest) -> Dispatch<UdpResponse, SocketError> {
        match request {
            UdpRequest::Create { family } => self.create(family).into(),
            UdpRequest::Bind { id, addr } => self
                .with_entry(id, |entry| udp_bind(&*entry.socket, addr))
                .into(),
            UdpRequest::Connect { id, addr } => self
                .with_entry(id, |entry| {
                    rustix::net::connect(&*entry.socket, &addr).map_err(|err| match err {
                        Errno::AFNOSUPPORT => ErrorCode::InvalidArgument.into(),
                        err => err.into(),
                    })
                })
                .into(),
            UdpRequest::Disconnect { id } => self
                .with_entry(id, |entry| udp_disconnect(&*entry.socket))
                .into(),
            UdpRequest::Send { id, data, addr } => self.send(id, data, addr),
            UdpRequest::Receive { id } => self.receive(id),
            UdpRequest::LocalAddress { id } => self.address(id, |s| s.local_addr()).into(),
            UdpRequest::RemoteAddress { id } => self.address(id, |s| s.peer_addr()).into(),
            UdpRequest::GetOption { id, option } => self.get_option(id, option).into(),
            UdpRequest::SetOption { id, option, value } => {
                self.set_option(id, option, value).into()
            }
            UdpRequest::Dispose { id } => {
                let _ = self.table.lock().unwrap_or_else(PoisonError::into_inner).delete(id);
                Dispatch::Ready(Ok(UdpResponse::Done))
            }
        }
    }
}

impl UdpWorker {
    fn create(&mut self, family: SocketAddressFamily) -> SocketResult<UdpResponse> {
        let fd = udp_socket(IpAddressFamily::from(family).into())?;
        if family == SocketAddressFamily::Ipv6 {
            sockopt::set_ipv6_v6only(&fd, true)?;
        }
        let socket = tokio::net::UdpSocket::from_std(std::net::UdpSocket::from(fd))?;
        let (disposed, _) = watch::channel(());
        let id = self.table.lock().unwrap_or_else(PoisonError::into_inner).push(UdpEntry {
            socket: Arc::new(socket),
            family,
            disposed,
        })?;
        Ok(UdpResponse::Created(id))
    }

    fn with_entry(
        &self,
        id: u32,
        f: impl FnOnce(&UdpEntry) -> SocketResult<()>,
    ) -> SocketResult<UdpResponse> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        f(table.get(id)?)?;
        Ok(UdpResponse::Done)
    }

    fn address(
        &self,
        id: u32,
        f: impl FnOnce(&tokio::net::UdpSocket) -> std::io::Result<SocketAddr>,
    ) -> SocketResult<UdpResponse> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let addr = f(&*table.get(id)?.socket)?;
        Ok(UdpResponse::Address(addr))
    }

    /// The socket of `id` and a receiver that completes once it is disposed.
    fn io_handles(
        &self,
        id: u32,
    ) -> SocketResult<(Arc<tokio::net::UdpSocket>, watch::Receiver<()>)> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = table.get(id)?;
        Ok((Arc::clone(&entry.socket), entry.disposed.subscribe()))
    }

    fn send(
        &self,
        id: u32,
        data: Bytes,
        addr: Option<SocketAddr>,
    ) -> Dispatch<UdpResponse, SocketError> {
        let (socket, mut disposed) = match self.io_handles(id) {
            Ok(handles) => handles,
            Err(e) => return Dispatch::Ready(Err(e)),
        };
        Dispatch::pending(async move {
            let sent = tokio::select! {
                res = async {
                    match addr {
                        Some(addr) => socket.send_to(&data, addr).await,
                        None => socket.send(&data).await,
                    }
                } => res.map_err(send_error)?,
                _ = disposed.changed() => return Err(disposed_error()),
            };
            if sent != data.len() {
                return Err(SocketError::with_detail(
                    ErrorCode::DatagramTooLarge,
                    format!("sent {sent} of {} bytes", data.len()),
                ));
            }
            Ok(UdpResponse::Done)
        })
    }

    fn receive(&self, id: u32) -> Dispatch<UdpResponse, SocketError> {
        let (socket, mut disposed) = match self.io_handles(id) {
            Ok(handles) => handles,
            Err(e) => return Dispatch::Ready(Err(e)),
        };
        Dispatch::pending(async move {
            let mut buf = vec![0; MAX_UDP_DATAGRAM_SIZE];
            let (n, remote_address) = tokio::select! {
                res = socket.recv_from(&mut buf) => res?,
                _ = disposed.changed() => return Err(disposed_error()),
            };
            buf.truncate(n);
            Ok(UdpResponse::Datagram(Datagram {
                data: Bytes::from(buf),
                remote_address,
            }))
        })
    }

    fn get_option(&self, id: u32, option: SocketOption) -> SocketResult<UdpResponse> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = table.get(id)?;
        let fd = &*entry.socket;
        let value = match option {
            SocketOption::HopLimit => u64::from(get_unicast_hop_limit(fd, entry.family)?),
            SocketOption::ReceiveBufferSize => receive_buffer_size(fd)?,
            SocketOption::SendBufferSize => send_buffer_size(fd)?,
            _ => return Err(ErrorCode::NotSupported.into()),
        };
        Ok(UdpResponse::Value(value))
    }

    fn set_option(&self, id: u32, option: SocketOption, value: u64) -> SocketResult<UdpResponse> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = table.get(id)?;
        let fd = &*entry.socket;
        let applied = match option {
            SocketOption::HopLimit => {
                let hops = u8::try_from(value)
                    .map_err(|_| SocketError::new(ErrorCode::InvalidArgument))?;
                set_unicast_hop_limit(fd, entry.family, hops)?;
                value
            }
            SocketOption::ReceiveBufferSize => set_receive_buffer_size(fd, value)?,
            SocketOption::SendBufferSize => set_send_buffer_size(fd, value)?,
            _ => return Err(ErrorCode::NotSupported.into()),
        };
        Ok(UdpResponse::Value(applied))
    }
}

fn send_error(err: std::io::Error) -> SocketError {
    match Errno::from_io_error(&err) {
        Some(Errno::MSGSIZE) => ErrorCode::DatagramTooLarge.into(),
        _ => err.into(),
    }
}

fn disposed_error() -> SocketError {
    SocketError::with_detail(ErrorCode::InvalidState, "socket was disposed")
}
