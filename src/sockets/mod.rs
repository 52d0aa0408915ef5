//! TCP and UDP sockets plus IP name lookup.
//!
//! The OS sockets live in process-wide background workers (one for TCP, one
//! for UDP). [`TcpSocket`] and [`UdpSocket`] are front ends that hold the
//! worker's handle for their socket, track the state machine locally so that
//! invalid transitions fail before anything is dispatched, and cache the
//! socket options they have set.

mod address;
mod error;
mod ip_name_lookup;
mod tcp;
mod tcp_worker;
mod udp;
mod udp_worker;
pub(crate) mod util;

pub use self::address::{IpAddressFamily, IpSocketAddress};
pub use self::error::{ErrorCode, SocketError, SocketResult};
pub(crate) use self::ip_name_lookup::resolve_addresses;
pub use self::tcp::{TcpSocket, TcpState};
pub use self::udp::{Datagram, UdpSocket, UdpState};

use core::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

/// Value taken from rust std library.
pub(crate) const DEFAULT_TCP_BACKLOG: u32 = 128;

/// Theoretical maximum byte size of a UDP datagram, the real limit is lower,
/// but we do not account for e.g. the transport layer here for simplicity.
/// In practice, datagrams are typically less than 1500 bytes.
pub(crate) const MAX_UDP_DATAGRAM_SIZE: usize = u16::MAX as usize;

#[derive(Copy, Clone, Debug)]
pub(crate) struct AllowedNetworkUses {
    pub(crate) ip_name_lookup: bool,
    pub(crate) udp: bool,
    pub(crate) tcp: bool,
}

impl Default for AllowedNetworkUses {
    fn default() -> Self {
        Self {
            ip_name_lookup: false,
            udp: true,
            tcp: true,
        }
    }
}

impl AllowedNetworkUses {
    pub(crate) fn check_allowed_udp(&self) -> SocketResult<()> {
        if !self.udp {
            return Err(SocketError::with_detail(
                ErrorCode::AccessDenied,
                "UDP is not allowed",
            ));
        }
        Ok(())
    }

    pub(crate) fn check_allowed_tcp(&self) -> SocketResult<()> {
        if !self.tcp {
            return Err(SocketError::with_detail(
                ErrorCode::AccessDenied,
                "TCP is not allowed",
            ));
        }
        Ok(())
    }

    pub(crate) fn check_allowed_ip_name_lookup(&self) -> SocketResult<()> {
        if !self.ip_name_lookup {
            return Err(SocketError::with_detail(
                ErrorCode::AccessDenied,
                "IP name lookup is not allowed",
            ));
        }
        Ok(())
    }
}

type CheckFn =
    dyn Fn(SocketAddr, SocketAddrUse) -> Pin<Box<dyn Future<Output = bool> + Send + Sync>>
        + Send
        + Sync;

/// A check that will be called for each socket address that is used of
/// whether the address is permitted.
#[derive(Clone)]
pub struct SocketAddrCheck(Arc<CheckFn>);

impl SocketAddrCheck {
    /// Returning `true` will permit socket connections to the `SocketAddr`,
    /// while returning `false` will reject the connection.
    pub fn new(
        f: impl Fn(SocketAddr, SocketAddrUse) -> Pin<Box<dyn Future<Output = bool> + Send + Sync>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self(Arc::new(f))
    }

    /// Permits every address.
    pub fn allow_all() -> Self {
        Self::new(|_, _| Box::pin(async { true }))
    }

    pub(crate) async fn check(&self, addr: SocketAddr, reason: SocketAddrUse) -> SocketResult<()> {
        if (self.0)(addr, reason).await {
            Ok(())
        } else {
            Err(SocketError::with_detail(
                ErrorCode::AccessDenied,
                "An address was not permitted by the socket address check.",
            ))
        }
    }
}

impl Default for SocketAddrCheck {
    fn default() -> Self {
        Self(Arc::new(|_, _| Box::pin(async { false })))
    }
}

impl std::fmt::Debug for SocketAddrCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketAddrCheck").finish_non_exhaustive()
    }
}

/// The reason what a socket address is being used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketAddrUse {
    /// Binding TCP socket
    TcpBind,
    /// Connecting TCP socket
    TcpConnect,
    /// Binding UDP socket
    UdpBind,
    /// Connecting UDP socket
    UdpConnect,
    /// Sending datagram on non-connected UDP socket
    UdpOutgoingDatagram,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SocketAddressFamily {
    Ipv4,
    Ipv6,
}

impl From<IpAddressFamily> for SocketAddressFamily {
    fn from(family: IpAddressFamily) -> Self {
        match family {
            IpAddressFamily::Ipv4 => SocketAddressFamily::Ipv4,
            IpAddressFamily::Ipv6 => SocketAddressFamily::Ipv6,
        }
    }
}

impl From<SocketAddressFamily> for IpAddressFamily {
    fn from(family: SocketAddressFamily) -> Self {
        match family {
            SocketAddressFamily::Ipv4 => IpAddressFamily::Ipv4,
            SocketAddressFamily::Ipv6 => IpAddressFamily::Ipv6,
        }
    }
}

/// Socket options the front ends cache and forward to their worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SocketOption {
    KeepAliveEnabled,
    /// Nanoseconds.
    KeepAliveIdleTime,
    /// Nanoseconds.
    KeepAliveInterval,
    KeepAliveCount,
    HopLimit,
    ReceiveBufferSize,
    SendBufferSize,
}

/// Locally cached option values; `None` until set through the front end.
#[derive(Clone, Debug, Default)]
pub(crate) struct OptionCache {
    pub(crate) keep_alive_enabled: Option<bool>,
    pub(crate) keep_alive_idle_time: Option<u64>,
    pub(crate) keep_alive_interval: Option<u64>,
    pub(crate) keep_alive_count: Option<u32>,
    pub(crate) hop_limit: Option<u8>,
    pub(crate) receive_buffer_size: Option<u64>,
    pub(crate) send_buffer_size: Option<u64>,
}
