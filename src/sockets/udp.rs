use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use super::udp_worker::{ROUTER, UdpRequest};
use super::util::{validate_local_address, validate_remote_address};
use super::{
    AllowedNetworkUses, ErrorCode, IpAddressFamily, MAX_UDP_DATAGRAM_SIZE, OptionCache,
    SocketAddrCheck, SocketAddrUse, SocketAddressFamily, SocketError, SocketOption, SocketResult,
};

/// The state of a UDP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    /// The initial state for a newly-created socket.
    Unbound,

    /// Bound the socket to a specific local address.
    Bound,

    /// The socket only exchanges datagrams with this peer.
    Connected(SocketAddr),

    /// The socket was disposed.
    Closed,
}

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Bytes,
    pub remote_address: SocketAddr,
}

/// A UDP socket.
pub struct UdpSocket {
    id: u32,
    family: SocketAddressFamily,
    state: UdpState,
    options: OptionCache,
    addr_check: SocketAddrCheck,
    disposed: bool,
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl UdpSocket {
    pub(crate) fn new(
        allowed: &AllowedNetworkUses,
        addr_check: SocketAddrCheck,
        family: IpAddressFamily,
    ) -> SocketResult<Self> {
        allowed.check_allowed_udp()?;
        let family = SocketAddressFamily::from(family);
        let id = ROUTER
            .submit_blocking(UdpRequest::Create { family })?
            .created()?;
        Ok(UdpSocket {
            id,
            family,
            state: UdpState::Unbound,
            options: OptionCache::default(),
            addr_check,
            disposed: false,
        })
    }

    pub fn state(&self) -> UdpState {
        self.state
    }

    pub fn address_family(&self) -> IpAddressFamily {
        self.family.into()
    }

    pub async fn bind(&mut self, local_address: SocketAddr) -> SocketResult<()> {
        if self.state != UdpState::Unbound {
            return Err(ErrorCode::InvalidState.into());
        }
        validate_local_address(local_address, self.family)?;
        self.addr_check
            .check(local_address, SocketAddrUse::UdpBind)
            .await?;
        ROUTER
            .submit(UdpRequest::Bind {
                id: self.id,
                addr: local_address,
            })
            .await?;
        self.state = UdpState::Bound;
        Ok(())
    }

    /// Fixes the peer for later sends and receives. No traffic is generated.
    ///
    /// Connecting an already connected socket replaces the peer.
    pub async fn connect(&mut self, remote_address: SocketAddr) -> SocketResult<()> {
        if matches!(self.state, UdpState::Unbound | UdpState::Closed) {
            return Err(ErrorCode::InvalidState.into());
        }
        validate_remote_address(remote_address, self.family)?;
        self.addr_check
            .check(remote_address, SocketAddrUse::UdpConnect)
            .await?;
        if let UdpState::Connected(_) = self.state {
            self.disconnect().await?;
        }
        ROUTER
            .submit(UdpRequest::Connect {
                id: self.id,
                addr: remote_address,
            })
            .await?;
        self.state = UdpState::Connected(remote_address);
        Ok(())
    }

    /// Dissolves the peer association and returns to the bound state.
    pub async fn disconnect(&mut self) -> SocketResult<()> {
        if !matches!(self.state, UdpState::Connected(_)) {
            return Err(ErrorCode::InvalidState.into());
        }
        ROUTER
            .submit(UdpRequest::Disconnect { id: self.id })
            .await?;
        self.state = UdpState::Bound;
        Ok(())
    }

    /// Sends one datagram, to `remote_address` or to the connected peer.
    ///
    /// An unbound socket is bound to the wildcard address of its family
    /// first.
    pub async fn send(
        &mut self,
        data: impl Into<Bytes>,
        remote_address: Option<SocketAddr>,
    ) -> SocketResult<()> {
        let data = data.into();
        if data.len() > MAX_UDP_DATAGRAM_SIZE {
            return Err(ErrorCode::DatagramTooLarge.into());
        }
        let addr = match (self.state, remote_address) {
            (UdpState::Closed, _) => return Err(ErrorCode::InvalidState.into()),
            (UdpState::Connected(_), None) => None,
            (UdpState::Connected(peer), Some(addr)) => {
                if addr != peer {
                    return Err(SocketError::with_detail(
                        ErrorCode::InvalidArgument,
                        "destination does not match the connected peer",
                    ));
                }
                None
            }
            (_, None) => {
                return Err(SocketError::with_detail(
                    ErrorCode::InvalidArgument,
                    "no destination for an unconnected socket",
                ));
            }
            (_, Some(addr)) => {
                validate_remote_address(addr, self.family)?;
                self.addr_check
                    .check(addr, SocketAddrUse::UdpOutgoingDatagram)
                    .await?;
                Some(addr)
            }
        };
        if self.state == UdpState::Unbound {
            self.implicit_bind().await?;
        }
        ROUTER
            .submit(UdpRequest::Send {
                id: self.id,
                data,
                addr,
            })
            .await?;
        Ok(())
    }

    async fn implicit_bind(&mut self) -> SocketResult<()> {
        let any = match self.family {
            SocketAddressFamily::Ipv4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddressFamily::Ipv6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        ROUTER
            .submit(UdpRequest::Bind {
                id: self.id,
                addr: any,
            })
            .await?;
        self.state = UdpState::Bound;
        Ok(())
    }

    /// Waits for the next datagram. A connected socket only sees datagrams
    /// from its peer.
    pub async fn receive(&mut self) -> SocketResult<Datagram> {
        match self.state {
            UdpState::Bound | UdpState::Connected(_) => {}
            UdpState::Unbound | UdpState::Closed => return Err(ErrorCode::InvalidState.into()),
        }
        ROUTER
            .submit(UdpRequest::Receive { id: self.id })
            .await?
            .datagram()
    }

    pub fn local_address(&self) -> SocketResult<SocketAddr> {
        match self.state {
            UdpState::Bound | UdpState::Connected(_) => {}
            UdpState::Unbound | UdpState::Closed => return Err(ErrorCode::InvalidState.into()),
        }
        ROUTER
            .submit_blocking(UdpRequest::LocalAddress { id: self.id })?
            .address()
    }

    pub fn remote_address(&self) -> SocketResult<SocketAddr> {
        match self.state {
            UdpState::Connected(_) => ROUTER
                .submit_blocking(UdpRequest::RemoteAddress { id: self.id })?
                .address(),
            _ => Err(ErrorCode::InvalidState.into()),
        }
    }

    fn get_option(&self, option: SocketOption) -> SocketResult<u64> {
        if self.state == UdpState::Closed {
            return Err(ErrorCode::InvalidState.into());
        }
        ROUTER
            .submit_blocking(UdpRequest::GetOption { id: self.id, option })?
            .value()
    }

    fn set_option(&self, option: SocketOption, value: u64) -> SocketResult<u64> {
        if self.state == UdpState::Closed {
            return Err(ErrorCode::InvalidState.into());
        }
        ROUTER
            .submit_blocking(UdpRequest::SetOption {
                id: self.id,
                option,
                value,
            })?
            .value()
    }

    pub fn unicast_hop_limit(&self) -> SocketResult<u8> {
        let value = self.get_option(SocketOption::HopLimit)?;
        Ok(u8::try_from(value).unwrap_or(u8::MAX))
    }

    pub fn set_unicast_hop_limit(&mut self, value: u8) -> SocketResult<()> {
        self.set_option(SocketOption::HopLimit, u64::from(value))?;
        self.options.hop_limit = Some(value);
        Ok(())
    }

    pub fn receive_buffer_size(&self) -> SocketResult<u64> {
        self.get_option(SocketOption::ReceiveBufferSize)
    }

    pub fn set_receive_buffer_size(&mut self, value: u64) -> SocketResult<()> {
        let applied = self.set_option(SocketOption::ReceiveBufferSize, value)?;
        self.options.receive_buffer_size = Some(applied);
        Ok(())
    }

    pub fn send_buffer_size(&self) -> SocketResult<u64> {
        self.get_option(SocketOption::SendBufferSize)
    }

    pub fn set_send_buffer_size(&mut self, value: u64) -> SocketResult<()> {
        let applied = self.set_option(SocketOption::SendBufferSize, value)?;
        self.options.send_buffer_size = Some(applied);
        Ok(())
    }

    /// Releases the OS socket. Pending receives fail with "invalid-state".
    pub fn dispose(&mut self) {
        if std::mem::replace(&mut self.disposed, true) {
            return;
        }
        self.state = UdpState::Closed;
        ROUTER.post(UdpRequest::Dispose { id: self.id });
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        if !self.disposed {
            tracing::debug!(id = self.id, "udp socket dropped without dispose");
            self.dispose();
        }
    }
}
