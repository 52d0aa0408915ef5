use std::error::Error as _;
use std::io;

use crate::error::{ErrorTag, TaggedError};
use crate::stream::StreamError;
use crate::table::TableError;

pub type HttpResult<T> = Result<T, HttpError>;

pub type HttpError = TaggedError<ErrorCode>;

/// Canonical HTTP error tags.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("invalid-argument")]
    InvalidArgument,
    #[error("invalid-state")]
    InvalidState,
    #[error("HTTP-protocol-error")]
    HttpProtocolError,
    #[error("DNS-error")]
    DnsError {
        rcode: Option<String>,
        info_code: Option<u16>,
    },
    #[error("connection-refused")]
    ConnectionRefused,
    /// The connect budget ran out.
    #[error("connection-timeout")]
    ConnectionTimeout,
    /// No response head arrived within the first-byte budget.
    #[error("connection-read-timeout")]
    ConnectionReadTimeout,
    /// A body stalled for longer than the between-bytes budget.
    #[error("between-bytes-timeout")]
    BetweenBytesTimeout,
    #[error("connection-terminated")]
    ConnectionTerminated,
    #[error("internal-error")]
    InternalError,
}

impl ErrorTag for ErrorCode {
    fn fallback() -> Self {
        ErrorCode::InternalError
    }
}

/// Why a [`Fields`](super::Fields) mutation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("invalid-syntax")]
    InvalidSyntax,
    #[error("forbidden")]
    Forbidden,
    #[error("immutable")]
    Immutable,
}

impl From<HeaderError> for HttpError {
    fn from(err: HeaderError) -> Self {
        HttpError::with_detail(ErrorCode::InvalidArgument, err.to_string())
    }
}

impl From<TableError> for HttpError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::NotPresent => HttpError::with_detail(ErrorCode::InvalidState, err.to_string()),
            TableError::Full => HttpError::with_detail(ErrorCode::InternalError, err.to_string()),
        }
    }
}

pub(crate) fn dns_error(rcode: String, info_code: u16) -> HttpError {
    ErrorCode::DnsError {
        rcode: Some(rcode),
        info_code: Some(info_code),
    }
    .into()
}

/// Translate a [`hyper::Error`] raised while sending a request.
pub(crate) fn hyper_request_error(err: hyper::Error) -> HttpError {
    // If there's a source, we might be able to extract an error from it.
    if let Some(cause) = err.source() {
        if let Some(err) = cause.downcast_ref::<HttpError>() {
            return err.clone();
        }
    }

    tracing::warn!("hyper request error: {err:?}");

    hyper_error(err)
}

/// Translate a [`hyper::Error`] raised while receiving a body.
pub(crate) fn hyper_response_error(err: hyper::Error) -> HttpError {
    if err.is_timeout() {
        return ErrorCode::ConnectionReadTimeout.into();
    }

    tracing::warn!("hyper response error: {err:?}");

    hyper_error(err)
}

fn hyper_error(err: hyper::Error) -> HttpError {
    let code = if err.is_parse() || err.is_parse_status() || err.is_incomplete_message() {
        ErrorCode::HttpProtocolError
    } else if err.is_closed() || err.is_canceled() || err.is_body_write_aborted() {
        ErrorCode::ConnectionTerminated
    } else if err.is_timeout() {
        ErrorCode::ConnectionReadTimeout
    } else {
        ErrorCode::InternalError
    };
    HttpError::with_detail(code, err.to_string())
}

/// Translate a failure to open the TCP connection for a request.
pub(crate) fn connect_error(err: io::Error) -> HttpError {
    match err.kind() {
        io::ErrorKind::AddrNotAvailable => dns_error("address not available".to_string(), 0),
        io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused.into(),
        _ if err
            .to_string()
            .starts_with("failed to lookup address information") =>
        {
            dns_error("address not available".to_string(), 0)
        }
        _ => HttpError::with_detail(ErrorCode::ConnectionRefused, err.to_string()),
    }
}

/// Recovers the error a body stream was aborted with.
pub(crate) fn body_stream_error(err: StreamError) -> HttpError {
    if let Some(err) = err.downcast_ref::<HttpError>() {
        return err.clone();
    }
    match err {
        StreamError::Closed | StreamError::Cancelled(_) => {
            HttpError::with_detail(ErrorCode::ConnectionTerminated, err.to_string())
        }
        StreamError::LastOperationFailed(e) => HttpError::unknown(format!("{e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_render_canonically() {
        assert_eq!(ErrorCode::HttpProtocolError.to_string(), "HTTP-protocol-error");
        let e = dns_error("NXDOMAIN".to_string(), 3);
        assert_eq!(e.to_string(), "DNS-error");
        assert_eq!(HeaderError::Forbidden.to_string(), "forbidden");
    }

    #[test]
    fn aborted_bodies_keep_their_error() {
        let err = body_stream_error(StreamError::LastOperationFailed(
            HttpError::new(ErrorCode::BetweenBytesTimeout).into(),
        ));
        assert_eq!(*err.code(), ErrorCode::BetweenBytesTimeout);
        let err = body_stream_error(StreamError::Closed);
        assert_eq!(*err.code(), ErrorCode::ConnectionTerminated);
    }

    #[test]
    fn refused_connections() {
        let err = connect_error(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(*err.code(), ErrorCode::ConnectionRefused);
    }
}
