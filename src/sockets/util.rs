//! Address validation and syscall wrappers with (opinionated) portability
//! fixes, shared by the TCP and UDP workers.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use cap_net_ext::{AddressFamily, Blocking, UdpSocketExt};
use rustix::fd::{AsFd, OwnedFd};
use rustix::io::Errno;
use rustix::net::sockopt;

use super::{ErrorCode, SocketAddressFamily, SocketError, SocketResult};

pub(crate) fn is_valid_unicast_address(addr: IpAddr) -> bool {
    match to_canonical(&addr) {
        IpAddr::V4(ipv4) => !ipv4.is_multicast() && !ipv4.is_broadcast(),
        IpAddr::V6(ipv6) => !ipv6.is_multicast(),
    }
}

pub(crate) fn is_valid_remote_address(addr: SocketAddr) -> bool {
    !to_canonical(&addr.ip()).is_unspecified() && addr.port() != 0
}

pub(crate) fn is_valid_address_family(addr: IpAddr, socket_family: SocketAddressFamily) -> bool {
    match (socket_family, addr) {
        (SocketAddressFamily::Ipv4, IpAddr::V4(_)) => true,
        (SocketAddressFamily::Ipv6, IpAddr::V6(ipv6)) => {
            // Reject IPv4-*compatible* IPv6 addresses. They have been deprecated
            // since 2006, OS handling of them is inconsistent and our own
            // validations don't take them into account either.
            // Note that these are not the same as IPv4-*mapped* IPv6 addresses.
            !is_deprecated_ipv4_compatible(ipv6) && ipv6.to_ipv4_mapped().is_none()
        }
        _ => false,
    }
}

/// Checks an address a socket is about to bind to.
pub(crate) fn validate_local_address(
    addr: SocketAddr,
    family: SocketAddressFamily,
) -> SocketResult<()> {
    if !is_valid_address_family(addr.ip(), family) {
        return Err(SocketError::with_detail(
            ErrorCode::InvalidArgument,
            "address family mismatch",
        ));
    }
    if !is_valid_unicast_address(addr.ip()) {
        return Err(SocketError::with_detail(
            ErrorCode::InvalidArgument,
            "multicast and broadcast addresses are not supported",
        ));
    }
    Ok(())
}

/// Checks an address a socket is about to connect or send to.
pub(crate) fn validate_remote_address(
    addr: SocketAddr,
    family: SocketAddressFamily,
) -> SocketResult<()> {
    validate_local_address(addr, family)?;
    if !is_valid_remote_address(addr) {
        return Err(SocketError::with_detail(
            ErrorCode::InvalidArgument,
            "remote address may not be unspecified or use port 0",
        ));
    }
    Ok(())
}

// Can be removed once `IpAddr::to_canonical` becomes stable.
pub(crate) fn to_canonical(addr: &IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(ipv4) => IpAddr::V4(*ipv4),
        IpAddr::V6(ipv6) => {
            if let Some(ipv4) = ipv6.to_ipv4_mapped() {
                IpAddr::V4(ipv4)
            } else {
                IpAddr::V6(*ipv6)
            }
        }
    }
}

fn is_deprecated_ipv4_compatible(addr: Ipv6Addr) -> bool {
    matches!(addr.segments(), [0, 0, 0, 0, 0, 0, _, _])
        && addr != Ipv6Addr::UNSPECIFIED
        && addr != Ipv6Addr::LOCALHOST
}

pub(crate) fn udp_socket(family: AddressFamily) -> std::io::Result<OwnedFd> {
    // Delegate socket creation to cap_net_ext. They handle a couple of things for us:
    // - On Windows: call WSAStartup if not done before.
    // - Set the NONBLOCK and CLOEXEC flags. Either immediately during socket creation,
    //   or afterwards using ioctl or fcntl. Exact method depends on the platform.
    let socket = cap_std::net::UdpSocket::new(family, Blocking::No)?;
    Ok(OwnedFd::from(socket))
}

pub(crate) fn tcp_bind(socket: &tokio::net::TcpSocket, local_address: SocketAddr) -> SocketResult<()> {
    // Automatically bypass the TIME_WAIT state when binding to a specific port
    // Unconditionally (re)set SO_REUSEADDR, even when the value is false.
    // This ensures we're not accidentally affected by any socket option
    // state left behind by a previous failed call to this method.
    #[cfg(not(windows))]
    sockopt::set_socket_reuseaddr(socket, local_address.port() > 0)?;

    // Perform the OS bind call.
    socket.bind(local_address).map_err(|err| {
        match Errno::from_io_error(&err) {
            // From https://pubs.opengroup.org/onlinepubs/9699919799/functions/bind.html:
            // > [EAFNOSUPPORT] The specified address is not a valid address for the address family of the specified socket
            //
            // The most common reasons for this error should have already
            // been handled by our own validation slightly higher up in this
            // function. This error mapping is here just in case there is
            // an edge case we didn't catch.
            Some(Errno::AFNOSUPPORT) => ErrorCode::InvalidArgument.into(),
            // See: https://learn.microsoft.com/en-us/windows/win32/api/winsock2/nf-winsock2-bind#:~:text=WSAENOBUFS
            // Windows returns WSAENOBUFS when the ephemeral ports have been exhausted.
            #[cfg(windows)]
            Some(Errno::NOBUFS) => ErrorCode::AddressInUse.into(),
            _ => SocketError::from(err),
        }
    })
}

pub(crate) fn udp_bind<Fd: AsFd>(sockfd: Fd, addr: SocketAddr) -> SocketResult<()> {
    rustix::net::bind(sockfd, &addr).map_err(|error| match error {
        Errno::AFNOSUPPORT => ErrorCode::InvalidArgument.into(),
        // Windows returns WSAENOBUFS when the ephemeral ports have been exhausted.
        #[cfg(windows)]
        Errno::NOBUFS => ErrorCode::AddressInUse.into(),
        error => error.into(),
    })
}

pub(crate) fn udp_disconnect<Fd: AsFd>(sockfd: Fd) -> SocketResult<()> {
    match rustix::net::connect_unspec(sockfd) {
        // BSD platforms return an error even if the UDP socket was disconnected successfully.
        //
        // MacOS was kind enough to document this: https://developer.apple.com/library/archive/documentation/System/Conceptual/ManPages_iPhoneOS/man2/connect.2.html
        // > Datagram sockets may dissolve the association by connecting to an
        // > invalid address, such as a null address or an address with the address
        // > family set to AF_UNSPEC (the error EAFNOSUPPORT will be harmlessly
        // > returned).
        #[cfg(target_os = "macos")]
        Err(Errno::INVAL | Errno::AFNOSUPPORT) => Ok(()),
        r => Ok(r?),
    }
}

/// Whether an option setter failed only because the platform cannot apply
/// that option after the fact.
pub(crate) fn is_unsupported_option(err: &SocketError) -> bool {
    *err.code() == ErrorCode::NotSupported
}

pub(crate) fn set_keep_alive_idle_time<Fd: AsFd>(sockfd: Fd, value: u64) -> SocketResult<u64> {
    const NANOS_PER_SEC: u64 = 1_000_000_000;

    // Ensure that the value passed to the actual syscall never gets rounded down to 0.
    const MIN: u64 = NANOS_PER_SEC;

    // Cap it at Linux' maximum, which appears to have the lowest limit across our supported platforms.
    const MAX: u64 = (i16::MAX as u64) * NANOS_PER_SEC;

    if value == 0 {
        // WIT: "If the provided value is 0, an `invalid-argument` error is returned."
        return Err(ErrorCode::InvalidArgument.into());
    }
    let value = value.clamp(MIN, MAX);
    sockopt::set_tcp_keepidle(sockfd, Duration::from_nanos(value))?;
    Ok(value)
}

pub(crate) fn set_keep_alive_interval<Fd: AsFd>(sockfd: Fd, value: u64) -> SocketResult<u64> {
    const NANOS_PER_SEC: u64 = 1_000_000_000;
    const MIN: u64 = NANOS_PER_SEC;
    const MAX: u64 = (i16::MAX as u64) * NANOS_PER_SEC;

    if value == 0 {
        return Err(ErrorCode::InvalidArgument.into());
    }
    let value = value.clamp(MIN, MAX);
    sockopt::set_tcp_keepintvl(sockfd, Duration::from_nanos(value))?;
    Ok(value)
}

pub(crate) fn set_keep_alive_count<Fd: AsFd>(sockfd: Fd, value: u32) -> SocketResult<u32> {
    const MIN_CNT: u32 = 1;
    // Cap it at Linux' maximum, which appears to have the lowest limit across our supported platforms.
    const MAX_CNT: u32 = i8::MAX as u32;

    if value == 0 {
        return Err(ErrorCode::InvalidArgument.into());
    }
    let value = value.clamp(MIN_CNT, MAX_CNT);
    sockopt::set_tcp_keepcnt(sockfd, value)?;
    Ok(value)
}

pub(crate) fn get_unicast_hop_limit<Fd: AsFd>(
    sockfd: Fd,
    family: SocketAddressFamily,
) -> SocketResult<u8> {
    match family {
        SocketAddressFamily::Ipv4 => {
            let v = sockopt::ip_ttl(sockfd)?;
            u8::try_from(v).map_err(|_| ErrorCode::NotSupported.into())
        }
        SocketAddressFamily::Ipv6 => Ok(sockopt::ipv6_unicast_hops(sockfd)?),
    }
}

pub(crate) fn set_unicast_hop_limit<Fd: AsFd>(
    sockfd: Fd,
    family: SocketAddressFamily,
    value: u8,
) -> SocketResult<()> {
    if value == 0 {
        // WIT: "If the provided value is 0, an `invalid-argument` error is returned."
        //
        // A well-behaved IP application should never send out new packets with TTL 0.
        // We validate the value ourselves because OS'es are not consistent in this.
        // On Linux the validation is even inconsistent between their IPv4 and IPv6 implementation.
        return Err(ErrorCode::InvalidArgument.into());
    }
    match family {
        SocketAddressFamily::Ipv4 => sockopt::set_ip_ttl(sockfd, value.into())?,
        SocketAddressFamily::Ipv6 => sockopt::set_ipv6_unicast_hops(sockfd, Some(value))?,
    }
    Ok(())
}

fn normalize_get_buffer_size(value: usize) -> usize {
    if cfg!(target_os = "linux") {
        // Linux doubles the value passed to setsockopt to allow space for bookkeeping overhead.
        // getsockopt returns this internally doubled value.
        // We'll half the value to at least get it back into the same ballpark that the application requested it in.
        value / 2
    } else {
        value
    }
}

fn normalize_set_buffer_size(value: u64) -> usize {
    const MAX: usize = i32::MAX as usize;
    usize::try_from(value).unwrap_or(MAX).clamp(1, MAX)
}

pub(crate) fn receive_buffer_size<Fd: AsFd>(sockfd: Fd) -> SocketResult<u64> {
    let value = sockopt::socket_recv_buffer_size(sockfd)?;
    Ok(u64::try_from(normalize_get_buffer_size(value)).unwrap_or(u64::MAX))
}

pub(crate) fn send_buffer_size<Fd: AsFd>(sockfd: Fd) -> SocketResult<u64> {
    let value = sockopt::socket_send_buffer_size(sockfd)?;
    Ok(u64::try_from(normalize_get_buffer_size(value)).unwrap_or(u64::MAX))
}

pub(crate) fn set_receive_buffer_size<Fd: AsFd>(sockfd: Fd, value: u64) -> SocketResult<u64> {
    if value == 0 {
        // WIT: "If the provided value is 0, an `invalid-argument` error is returned."
        return Err(ErrorCode::InvalidArgument.into());
    }
    let value = normalize_set_buffer_size(value);
    match sockopt::set_socket_recv_buffer_size(sockfd, value) {
        // Most platforms treat the value passed to SO_SNDBUF/SO_RCVBUF as a
        // performance tuning hint and silently clamp the input if it exceeds
        // their capability. Only the *BSD family views this option as a hard
        // requirement. We normalize this in favor of the "performance hint"
        // semantics; even ENOBUFS is "Ok".
        Err(Errno::NOBUFS) => {}
        r => r?,
    }
    Ok(u64::try_from(value).unwrap_or(u64::MAX))
}

pub(crate) fn set_send_buffer_size<Fd: AsFd>(sockfd: Fd, value: u64) -> SocketResult<u64> {
    if value == 0 {
        return Err(ErrorCode::InvalidArgument.into());
    }
    let value = normalize_set_buffer_size(value);
    match sockopt::set_socket_send_buffer_size(sockfd, value) {
        Err(Errno::NOBUFS) => {} // See set_receive_buffer_size
        r => r?,
    }
    Ok(u64::try_from(value).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn family_mismatch_is_rejected() {
        let err = validate_local_address(addr("[::1]:0"), SocketAddressFamily::Ipv4).unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InvalidArgument);
        let err =
            validate_local_address(addr("[::ffff:127.0.0.1]:0"), SocketAddressFamily::Ipv6)
                .unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InvalidArgument);
        let err = validate_local_address(addr("[::1.2.3.4]:0"), SocketAddressFamily::Ipv6)
            .unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InvalidArgument);
        validate_local_address(addr("[::1]:0"), SocketAddressFamily::Ipv6).unwrap();
    }

    #[test]
    fn multicast_and_broadcast_are_rejected() {
        for a in ["224.0.0.1:80", "255.255.255.255:80"] {
            assert!(validate_local_address(addr(a), SocketAddressFamily::Ipv4).is_err());
        }
        assert!(validate_local_address(addr("[ff02::1]:80"), SocketAddressFamily::Ipv6).is_err());
    }

    #[test]
    fn remote_addresses_need_a_host_and_port() {
        let v4 = SocketAddressFamily::Ipv4;
        assert!(validate_remote_address(addr("0.0.0.0:80"), v4).is_err());
        assert!(validate_remote_address(addr("127.0.0.1:0"), v4).is_err());
        validate_remote_address(addr("127.0.0.1:80"), v4).unwrap();
        validate_local_address(addr("0.0.0.0:0"), v4).unwrap();
    }

    #[test]
    fn buffer_sizes_are_clamped() {
        assert_eq!(normalize_set_buffer_size(u64::MAX), i32::MAX as usize);
        assert_eq!(normalize_set_buffer_size(1), 1);
    }
}
