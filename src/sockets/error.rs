use crate::error::{ErrorTag, TaggedError};
use crate::table::TableError;
use rustix::io::Errno;
use std::io;

pub type SocketResult<T> = Result<T, SocketError>;

pub type SocketError = TaggedError<ErrorCode>;

/// Canonical socket error tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorCode {
    #[error("unknown")]
    Unknown,
    #[error("access-denied")]
    AccessDenied,
    #[error("not-supported")]
    NotSupported,
    #[error("invalid-argument")]
    InvalidArgument,
    #[error("out-of-memory")]
    OutOfMemory,
    #[error("timeout")]
    Timeout,
    #[error("concurrency-conflict")]
    ConcurrencyConflict,
    #[error("not-in-progress")]
    NotInProgress,
    #[error("would-block")]
    WouldBlock,
    #[error("invalid-state")]
    InvalidState,
    #[error("new-socket-limit")]
    NewSocketLimit,
    #[error("address-not-bindable")]
    AddressNotBindable,
    #[error("address-in-use")]
    AddressInUse,
    #[error("remote-unreachable")]
    RemoteUnreachable,
    #[error("connection-refused")]
    ConnectionRefused,
    #[error("connection-reset")]
    ConnectionReset,
    #[error("connection-aborted")]
    ConnectionAborted,
    #[error("datagram-too-large")]
    DatagramTooLarge,
    #[error("name-unresolvable")]
    NameUnresolvable,
    #[error("temporary-resolver-failure")]
    TemporaryResolverFailure,
    #[error("permanent-resolver-failure")]
    PermanentResolverFailure,
}

impl ErrorTag for ErrorCode {
    fn fallback() -> Self {
        ErrorCode::Unknown
    }
}

fn from_errno(errno: Errno) -> Option<ErrorCode> {
    Some(match errno {
        Errno::WOULDBLOCK => ErrorCode::WouldBlock,
        #[allow(
            unreachable_patterns,
            reason = "EWOULDBLOCK and EAGAIN can have the same value"
        )]
        Errno::AGAIN => ErrorCode::WouldBlock,
        Errno::INTR => ErrorCode::WouldBlock,
        #[cfg(not(windows))]
        Errno::PERM => ErrorCode::AccessDenied,
        Errno::ACCESS => ErrorCode::AccessDenied,
        Errno::ADDRINUSE => ErrorCode::AddressInUse,
        Errno::ADDRNOTAVAIL => ErrorCode::AddressNotBindable,
        Errno::ALREADY => ErrorCode::ConcurrencyConflict,
        Errno::TIMEDOUT => ErrorCode::Timeout,
        Errno::CONNREFUSED => ErrorCode::ConnectionRefused,
        Errno::CONNRESET => ErrorCode::ConnectionReset,
        Errno::CONNABORTED => ErrorCode::ConnectionAborted,
        Errno::INVAL => ErrorCode::InvalidArgument,
        Errno::HOSTUNREACH => ErrorCode::RemoteUnreachable,
        Errno::HOSTDOWN => ErrorCode::RemoteUnreachable,
        Errno::NETDOWN => ErrorCode::RemoteUnreachable,
        Errno::NETUNREACH => ErrorCode::RemoteUnreachable,
        #[cfg(target_os = "linux")]
        Errno::NONET => ErrorCode::RemoteUnreachable,
        Errno::ISCONN => ErrorCode::InvalidState,
        Errno::NOTCONN => ErrorCode::InvalidState,
        Errno::DESTADDRREQ => ErrorCode::InvalidState,
        #[cfg(not(windows))]
        Errno::NFILE => ErrorCode::NewSocketLimit,
        Errno::MFILE => ErrorCode::NewSocketLimit,
        Errno::MSGSIZE => ErrorCode::DatagramTooLarge,
        #[cfg(not(windows))]
        Errno::NOMEM => ErrorCode::OutOfMemory,
        Errno::NOBUFS => ErrorCode::OutOfMemory,
        Errno::OPNOTSUPP => ErrorCode::NotSupported,
        Errno::NOPROTOOPT => ErrorCode::NotSupported,
        Errno::PFNOSUPPORT => ErrorCode::NotSupported,
        Errno::PROTONOSUPPORT => ErrorCode::NotSupported,
        Errno::PROTOTYPE => ErrorCode::NotSupported,
        Errno::SOCKTNOSUPPORT => ErrorCode::NotSupported,
        Errno::AFNOSUPPORT => ErrorCode::NotSupported,
        _ => return None,
    })
}

impl From<&io::Error> for ErrorCode {
    fn from(err: &io::Error) -> Self {
        // Attempt the more detailed native error code first.
        if let Some(code) = Errno::from_io_error(err).and_then(from_errno) {
            return code;
        }
        match err.kind() {
            io::ErrorKind::AddrInUse => ErrorCode::AddressInUse,
            io::ErrorKind::AddrNotAvailable => ErrorCode::AddressNotBindable,
            io::ErrorKind::ConnectionAborted => ErrorCode::ConnectionAborted,
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorCode::ConnectionReset,
            io::ErrorKind::Interrupted => ErrorCode::WouldBlock,
            io::ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
            io::ErrorKind::NotConnected => ErrorCode::InvalidState,
            io::ErrorKind::OutOfMemory => ErrorCode::OutOfMemory,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            io::ErrorKind::TimedOut => ErrorCode::Timeout,
            io::ErrorKind::Unsupported => ErrorCode::NotSupported,
            io::ErrorKind::WouldBlock => ErrorCode::WouldBlock,
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        match ErrorCode::from(&err) {
            ErrorCode::Unknown => {
                tracing::debug!("unknown I/O error: {err}");
                SocketError::with_detail(ErrorCode::Unknown, err.to_string())
            }
            code => SocketError::new(code),
        }
    }
}

impl From<Errno> for SocketError {
    fn from(errno: Errno) -> Self {
        match from_errno(errno) {
            Some(code) => SocketError::new(code),
            None => {
                tracing::debug!("unknown I/O error: {errno}");
                SocketError::with_detail(ErrorCode::Unknown, errno.to_string())
            }
        }
    }
}

/// A handle that the worker does not know about can only come from a socket
/// that was already disposed.
impl From<TableError> for SocketError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::NotPresent => SocketError::with_detail(ErrorCode::InvalidState, err.to_string()),
            TableError::Full => SocketError::new(ErrorCode::NewSocketLimit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_maps_to_tag() {
        let err = io::Error::from_raw_os_error(Errno::CONNREFUSED.raw_os_error());
        assert_eq!(*SocketError::from(err).code(), ErrorCode::ConnectionRefused);
        assert_eq!(*SocketError::from(Errno::ADDRINUSE).code(), ErrorCode::AddressInUse);
    }

    #[test]
    fn unmapped_errors_fall_back_to_unknown() {
        let err = SocketError::from(io::Error::other("gremlins"));
        assert_eq!(*err.code(), ErrorCode::Unknown);
        assert_eq!(err.to_string(), "unknown: gremlins");
    }

    #[test]
    fn stale_handles_are_invalid_state() {
        let err = SocketError::from(TableError::NotPresent);
        assert_eq!(*err.code(), ErrorCode::InvalidState);
    }
}
