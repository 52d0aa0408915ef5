use std::net::SocketAddr;

use bytes::Bytes;

use super::tcp_worker::{ROUTER, TcpRequest};
use super::util::{is_unsupported_option, validate_local_address, validate_remote_address};
use super::{
    AllowedNetworkUses, DEFAULT_TCP_BACKLOG, ErrorCode, IpAddressFamily, OptionCache,
    SocketAddrCheck, SocketAddrUse, SocketAddressFamily, SocketError, SocketOption, SocketResult,
};
use crate::future::{FutureReader, future_pair};
use crate::stream::{StreamReader, stream_pair};

/// The state of a TCP socket.
///
/// This represents the various states a socket can be in during the
/// activities of binding, listening, accepting, and connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// The initial state for a newly-created socket.
    Unbound,

    /// Binding finished. The socket has an address but is not yet listening
    /// for connections.
    Bound,

    /// The socket is now listening and waiting for incoming connections.
    Listening,

    /// An outgoing connection is started.
    Connecting,

    /// A connection has been established.
    Connected,

    /// The socket was disposed or a connection attempt failed.
    Closed,
}

/// A TCP socket, plus associated bookkeeping.
///
/// The OS socket itself lives in the TCP worker; this handle tracks the
/// state machine so that operations in the wrong state fail before anything
/// is dispatched.
pub struct TcpSocket {
    id: u32,
    family: SocketAddressFamily,
    state: TcpState,
    /// The desired listen queue size.
    listen_backlog_size: u32,
    options: OptionCache,
    addr_check: SocketAddrCheck,
    sending: bool,
    receiving: bool,
    disposed: bool,
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl TcpSocket {
    /// Create a new socket in the given family.
    pub(crate) fn new(
        allowed: &AllowedNetworkUses,
        addr_check: SocketAddrCheck,
        family: IpAddressFamily,
    ) -> SocketResult<Self> {
        allowed.check_allowed_tcp()?;
        let family = SocketAddressFamily::from(family);
        let id = ROUTER
            .submit_blocking(TcpRequest::Create { family })?
            .created()?;
        Ok(Self::from_state(id, family, TcpState::Unbound, addr_check))
    }

    /// A socket the worker accepted on a listener.
    pub(crate) fn accepted(id: u32, family: SocketAddressFamily, addr_check: SocketAddrCheck) -> Self {
        Self::from_state(id, family, TcpState::Connected, addr_check)
    }

    fn from_state(
        id: u32,
        family: SocketAddressFamily,
        state: TcpState,
        addr_check: SocketAddrCheck,
    ) -> Self {
        TcpSocket {
            id,
            family,
            state,
            listen_backlog_size: DEFAULT_TCP_BACKLOG,
            options: OptionCache::default(),
            addr_check,
            sending: false,
            receiving: false,
            disposed: false,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    fn require(&self, valid: &[TcpState]) -> SocketResult<()> {
        if valid.contains(&self.state) {
            Ok(())
        } else {
            Err(ErrorCode::InvalidState.into())
        }
    }

    pub async fn bind(&mut self, local_address: SocketAddr) -> SocketResult<()> {
        self.require(&[TcpState::Unbound])?;
        validate_local_address(local_address, self.family)?;
        self.addr_check
            .check(local_address, SocketAddrUse::TcpBind)
            .await?;
        ROUTER
            .submit(TcpRequest::Bind {
                id: self.id,
                addr: local_address,
            })
            .await?;
        self.state = TcpState::Bound;
        Ok(())
    }

    /// Connects to `remote_address`. A failed attempt closes the socket.
    pub async fn connect(&mut self, remote_address: SocketAddr) -> SocketResult<()> {
        self.require(&[TcpState::Unbound, TcpState::Bound])?;
        validate_remote_address(remote_address, self.family)?;
        self.addr_check
            .check(remote_address, SocketAddrUse::TcpConnect)
            .await?;
        self.state = TcpState::Connecting;
        let res = ROUTER
            .submit(TcpRequest::Connect {
                id: self.id,
                addr: remote_address,
            })
            .await;
        match res {
            Ok(_) => {
                self.state = TcpState::Connected;
                Ok(())
            }
            Err(err) => {
                self.state = TcpState::Closed;
                Err(err)
            }
        }
    }

    /// Starts listening and returns the stream of accepted connections, in
    /// arrival order. Each accepted socket is independently disposable.
    pub async fn listen(&mut self) -> SocketResult<StreamReader<TcpSocket>> {
        self.require(&[TcpState::Unbound, TcpState::Bound])?;
        let (tx, rx) = stream_pair();
        ROUTER
            .submit(TcpRequest::Listen {
                id: self.id,
                backlog: self.listen_backlog_size,
                check: self.addr_check.clone(),
                stream: tx,
            })
            .await?;
        self.state = TcpState::Listening;
        Ok(rx)
    }

    /// Sends everything `data` yields, then shuts down the write half.
    ///
    /// The returned future settles once all data has been handed to the OS.
    pub fn send(&mut self, data: StreamReader<Bytes>) -> SocketResult<FutureReader<(), SocketError>> {
        self.require(&[TcpState::Connected])?;
        if self.sending {
            return Err(ErrorCode::InvalidState.into());
        }
        self.sending = true;
        let (done, rx) = future_pair();
        ROUTER.post(TcpRequest::Send {
            id: self.id,
            data,
            done,
        });
        Ok(rx)
    }

    /// Streams the bytes received on the connection until the peer shuts
    /// down its write half.
    pub fn receive(
        &mut self,
    ) -> SocketResult<(StreamReader<Bytes>, FutureReader<(), SocketError>)> {
        self.require(&[TcpState::Connected])?;
        if self.receiving {
            return Err(ErrorCode::InvalidState.into());
        }
        self.receiving = true;
        let (tx, rx) = stream_pair();
        let (done, done_rx) = future_pair();
        ROUTER.post(TcpRequest::Receive {
            id: self.id,
            stream: tx,
            done,
        });
        Ok((rx, done_rx))
    }

    pub fn local_address(&self) -> SocketResult<SocketAddr> {
        self.require(&[TcpState::Bound, TcpState::Listening, TcpState::Connected])?;
        ROUTER
            .submit_blocking(TcpRequest::LocalAddress { id: self.id })?
            .address()
    }

    pub fn remote_address(&self) -> SocketResult<SocketAddr> {
        self.require(&[TcpState::Connected])?;
        ROUTER
            .submit_blocking(TcpRequest::RemoteAddress { id: self.id })?
            .address()
    }

    pub fn is_listening(&self) -> bool {
        self.state == TcpState::Listening
    }

    pub fn address_family(&self) -> IpAddressFamily {
        self.family.into()
    }

    pub fn set_listen_backlog_size(&mut self, value: u64) -> SocketResult<()> {
        const MIN_BACKLOG: u32 = 1;
        const MAX_BACKLOG: u32 = i32::MAX as u32; // OS'es will most likely limit it down even further.

        if value == 0 {
            return Err(ErrorCode::InvalidArgument.into());
        }
        // Silently clamp backlog size. This is OK for us to do, because
        // operating systems do this too.
        let value = u32::try_from(value)
            .unwrap_or(MAX_BACKLOG)
            .clamp(MIN_BACKLOG, MAX_BACKLOG);
        match self.state {
            // Socket not listening yet. Stash value for first invocation to `listen`.
            TcpState::Unbound | TcpState::Bound => {}
            // We'll only update our own value if the OS supports changing the
            // backlog size after the fact.
            TcpState::Listening => {
                ROUTER.submit_blocking(TcpRequest::SetListenBacklog { id: self.id, value })?;
            }
            _ => return Err(ErrorCode::InvalidState.into()),
        }
        self.listen_backlog_size = value;
        Ok(())
    }

    fn get_option(&self, option: SocketOption) -> SocketResult<u64> {
        self.require_open()?;
        ROUTER
            .submit_blocking(TcpRequest::GetOption { id: self.id, option })?
            .value()
    }

    fn set_option(&self, option: SocketOption, value: u64) -> SocketResult<u64> {
        self.require_open()?;
        ROUTER
            .submit_blocking(TcpRequest::SetOption {
                id: self.id,
                option,
                value,
            })?
            .value()
    }

    fn require_open(&self) -> SocketResult<()> {
        self.require(&[
            TcpState::Unbound,
            TcpState::Bound,
            TcpState::Listening,
            TcpState::Connected,
        ])
    }

    /// Applies a keep-alive option. Platforms that cannot change the option
    /// after the fact still accept it; the value is cached and reported by
    /// the getter, but the OS behavior does not change.
    fn set_keep_alive_option(&self, option: SocketOption, value: u64) -> SocketResult<u64> {
        match self.set_option(option, value) {
            Err(err) if is_unsupported_option(&err) => {
                tracing::debug!(
                    id = self.id,
                    ?option,
                    value,
                    "keep-alive option not supported by the platform; caching only"
                );
                Ok(value)
            }
            res => res,
        }
    }

    fn get_keep_alive_option(&self, option: SocketOption, cached: Option<u64>) -> SocketResult<u64> {
        match (self.get_option(option), cached) {
            (Err(err), Some(value)) if is_unsupported_option(&err) => Ok(value),
            (res, _) => res,
        }
    }

    pub fn keep_alive_enabled(&self) -> SocketResult<bool> {
        Ok(self.get_option(SocketOption::KeepAliveEnabled)? != 0)
    }

    pub fn set_keep_alive_enabled(&mut self, value: bool) -> SocketResult<()> {
        self.set_option(SocketOption::KeepAliveEnabled, u64::from(value))?;
        self.options.keep_alive_enabled = Some(value);
        Ok(())
    }

    /// Idle time before the first keep-alive probe, in nanoseconds.
    pub fn keep_alive_idle_time(&self) -> SocketResult<u64> {
        self.get_keep_alive_option(
            SocketOption::KeepAliveIdleTime,
            self.options.keep_alive_idle_time,
        )
    }

    pub fn set_keep_alive_idle_time(&mut self, value: u64) -> SocketResult<()> {
        let applied = self.set_keep_alive_option(SocketOption::KeepAliveIdleTime, value)?;
        self.options.keep_alive_idle_time = Some(applied);
        Ok(())
    }

    /// Interval between keep-alive probes, in nanoseconds.
    pub fn keep_alive_interval(&self) -> SocketResult<u64> {
        self.get_keep_alive_option(
            SocketOption::KeepAliveInterval,
            self.options.keep_alive_interval,
        )
    }

    pub fn set_keep_alive_interval(&mut self, value: u64) -> SocketResult<()> {
        let applied = self.set_keep_alive_option(SocketOption::KeepAliveInterval, value)?;
        self.options.keep_alive_interval = Some(applied);
        Ok(())
    }

    pub fn keep_alive_count(&self) -> SocketResult<u32> {
        let cached = self.options.keep_alive_count.map(u64::from);
        let value = self.get_keep_alive_option(SocketOption::KeepAliveCount, cached)?;
        Ok(u32::try_from(value).unwrap_or(u32::MAX))
    }

    pub fn set_keep_alive_count(&mut self, value: u32) -> SocketResult<()> {
        let applied =
            self.set_keep_alive_option(SocketOption::KeepAliveCount, u64::from(value))?;
        self.options.keep_alive_count = Some(u32::try_from(applied).unwrap_or(u32::MAX));
        Ok(())
    }

    pub fn hop_limit(&self) -> SocketResult<u8> {
        let value = self.get_option(SocketOption::HopLimit)?;
        Ok(u8::try_from(value).unwrap_or(u8::MAX))
    }

    pub fn set_hop_limit(&mut self, value: u8) -> SocketResult<()> {
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

    /// Releases the OS socket. Only the first call has an effect.
    pub fn dispose(&mut self) {
        if std::mem::replace(&mut self.disposed, true) {
            return;
        }
        self.state = TcpState::Closed;
        ROUTER.post(TcpRequest::Dispose { id: self.id });
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if !self.disposed {
            tracing::debug!(id = self.id, "tcp socket dropped without dispose");
            self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket(family: IpAddressFamily) -> TcpSocket {
        TcpSocket::new(&AllowedNetworkUses::default(), SocketAddrCheck::allow_all(), family)
            .unwrap()
    }

    #[tokio::test]
    async fn family_mismatch_fails_before_dispatch() {
        let mut sock = socket(IpAddressFamily::Ipv4);
        let err = sock.bind("[::1]:0".parse().unwrap()).await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InvalidArgument);
        assert_eq!(sock.state(), TcpState::Unbound);
    }

    #[tokio::test]
    async fn connect_after_listen_is_invalid_state() {
        let mut sock = socket(IpAddressFamily::Ipv4);
        sock.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let _incoming = sock.listen().await.unwrap();
        assert!(sock.is_listening());
        let err = sock
            .connect("127.0.0.1:80".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn send_before_connect_is_invalid_state() {
        let mut sock = socket(IpAddressFamily::Ipv4);
        let err = sock.send(StreamReader::empty()).unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InvalidState);
        assert_eq!(*sock.receive().unwrap_err().code(), ErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn denied_addresses_are_access_denied() {
        let mut sock = TcpSocket::new(
            &AllowedNetworkUses::default(),
            SocketAddrCheck::default(),
            IpAddressFamily::Ipv4,
        )
        .unwrap();
        let err = sock.bind("127.0.0.1:0".parse().unwrap()).await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::AccessDenied);
    }

    #[test]
    fn disabled_tcp_is_access_denied() {
        let allowed = AllowedNetworkUses {
            tcp: false,
            ..AllowedNetworkUses::default()
        };
        let err = TcpSocket::new(&allowed, SocketAddrCheck::allow_all(), IpAddressFamily::Ipv4)
            .unwrap_err();
        assert_eq!(*err.code(), ErrorCode::AccessDenied);
    }

    #[test]
    fn backlog_is_validated_and_clamped() {
        let mut sock = socket(IpAddressFamily::Ipv4);
        assert_eq!(
            *sock.set_listen_backlog_size(0).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        sock.set_listen_backlog_size(u64::MAX).unwrap();
        assert_eq!(sock.listen_backlog_size, i32::MAX as u32);
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut sock = socket(IpAddressFamily::Ipv6);
        sock.dispose();
        sock.dispose();
        assert_eq!(sock.state(), TcpState::Closed);
        assert_eq!(*sock.hop_limit().unwrap_err().code(), ErrorCode::InvalidState);
    }

    // Linux lets two SO_REUSEADDR sockets bind one port, but only one of
    // them may listen on it.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_listen_keeps_the_socket_bound() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let mut first = socket(IpAddressFamily::Ipv4);
        let mut second = socket(IpAddressFamily::Ipv4);
        first.bind(addr).await.unwrap();
        second.bind(addr).await.unwrap();
        let _incoming = first.listen().await.unwrap();

        let err = second.listen().await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::AddressInUse);
        assert_eq!(second.state(), TcpState::Bound);
        assert_eq!(second.local_address().unwrap(), addr);

        // Retrying reaches the OS again instead of tripping over a
        // discarded socket.
        let err = second.listen().await.unwrap_err();
        assert_eq!(*err.code(), ErrorCode::AddressInUse);
    }
}
