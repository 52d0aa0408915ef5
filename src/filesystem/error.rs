use crate::error::{ErrorTag, TaggedError};
use std::io;

pub type FsResult<T> = Result<T, FsError>;

pub type FsError = TaggedError<ErrorCode>;

/// Canonical filesystem error tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorCode {
    #[error("access")]
    Access,
    #[error("already")]
    Already,
    #[error("bad-descriptor")]
    BadDescriptor,
    #[error("busy")]
    Busy,
    #[error("deadlock")]
    Deadlock,
    #[error("quota")]
    Quota,
    #[error("exist")]
    Exist,
    #[error("file-too-large")]
    FileTooLarge,
    #[error("illegal-byte-sequence")]
    IllegalByteSequence,
    #[error("in-progress")]
    InProgress,
    #[error("interrupted")]
    Interrupted,
    #[error("invalid")]
    Invalid,
    #[error("io")]
    Io,
    #[error("is-directory")]
    IsDirectory,
    #[error("loop")]
    Loop,
    #[error("too-many-links")]
    TooManyLinks,
    #[error("message-size")]
    MessageSize,
    #[error("name-too-long")]
    NameTooLong,
    #[error("no-device")]
    NoDevice,
    #[error("no-entry")]
    NoEntry,
    #[error("no-lock")]
    NoLock,
    #[error("insufficient-memory")]
    InsufficientMemory,
    #[error("insufficient-space")]
    InsufficientSpace,
    #[error("not-directory")]
    NotDirectory,
    #[error("not-empty")]
    NotEmpty,
    #[error("not-recoverable")]
    NotRecoverable,
    #[error("unsupported")]
    Unsupported,
    #[error("no-tty")]
    NoTty,
    #[error("no-such-device")]
    NoSuchDevice,
    #[error("overflow")]
    Overflow,
    #[error("not-permitted")]
    NotPermitted,
    #[error("pipe")]
    Pipe,
    #[error("read-only")]
    ReadOnly,
    #[error("invalid-seek")]
    InvalidSeek,
    #[error("text-file-busy")]
    TextFileBusy,
    #[error("cross-device")]
    CrossDevice,
}

impl ErrorTag for ErrorCode {
    fn fallback() -> Self {
        ErrorCode::Io
    }
}

#[cfg(unix)]
fn from_raw_os_error(err: Option<i32>) -> Option<ErrorCode> {
    use rustix::io::Errno as RustixErrno;
    let err = err?;
    Some(match RustixErrno::from_raw_os_error(err) {
        RustixErrno::PIPE => ErrorCode::Pipe,
        RustixErrno::PERM => ErrorCode::NotPermitted,
        RustixErrno::NOENT => ErrorCode::NoEntry,
        RustixErrno::NOMEM => ErrorCode::InsufficientMemory,
        RustixErrno::IO => ErrorCode::Io,
        RustixErrno::BADF => ErrorCode::BadDescriptor,
        RustixErrno::BUSY => ErrorCode::Busy,
        RustixErrno::ACCESS => ErrorCode::Access,
        RustixErrno::NOTDIR => ErrorCode::NotDirectory,
        RustixErrno::ISDIR => ErrorCode::IsDirectory,
        RustixErrno::INVAL => ErrorCode::Invalid,
        RustixErrno::EXIST => ErrorCode::Exist,
        RustixErrno::FBIG => ErrorCode::FileTooLarge,
        RustixErrno::NOSPC => ErrorCode::InsufficientSpace,
        RustixErrno::SPIPE => ErrorCode::InvalidSeek,
        RustixErrno::MLINK => ErrorCode::TooManyLinks,
        RustixErrno::NAMETOOLONG => ErrorCode::NameTooLong,
        RustixErrno::NOTEMPTY => ErrorCode::NotEmpty,
        RustixErrno::LOOP => ErrorCode::Loop,
        RustixErrno::OVERFLOW => ErrorCode::Overflow,
        RustixErrno::ILSEQ => ErrorCode::IllegalByteSequence,
        RustixErrno::NOTSUP => ErrorCode::Unsupported,
        RustixErrno::ALREADY => ErrorCode::Already,
        RustixErrno::INPROGRESS => ErrorCode::InProgress,
        RustixErrno::INTR => ErrorCode::Interrupted,
        RustixErrno::DEADLK => ErrorCode::Deadlock,
        RustixErrno::DQUOT => ErrorCode::Quota,
        RustixErrno::MSGSIZE => ErrorCode::MessageSize,
        RustixErrno::NODEV => ErrorCode::NoDevice,
        RustixErrno::NOLCK => ErrorCode::NoLock,
        RustixErrno::NOTRECOVERABLE => ErrorCode::NotRecoverable,
        RustixErrno::NOTTY => ErrorCode::NoTty,
        RustixErrno::NXIO => ErrorCode::NoSuchDevice,
        RustixErrno::ROFS => ErrorCode::ReadOnly,
        RustixErrno::TXTBSY => ErrorCode::TextFileBusy,
        RustixErrno::XDEV => ErrorCode::CrossDevice,

        #[allow(
            unreachable_patterns,
            reason = "OPNOTSUPP has the same value as NOTSUP on some platforms"
        )]
        RustixErrno::OPNOTSUPP => ErrorCode::Unsupported,

        _ => return None,
    })
}

#[cfg(not(unix))]
fn from_raw_os_error(_err: Option<i32>) -> Option<ErrorCode> {
    None
}

impl From<&io::Error> for ErrorCode {
    fn from(err: &io::Error) -> ErrorCode {
        match from_raw_os_error(err.raw_os_error()) {
            Some(code) => code,
            None => match err.kind() {
                io::ErrorKind::NotFound => ErrorCode::NoEntry,
                io::ErrorKind::PermissionDenied => ErrorCode::NotPermitted,
                io::ErrorKind::AlreadyExists => ErrorCode::Exist,
                io::ErrorKind::InvalidInput => ErrorCode::Invalid,
                io::ErrorKind::NotADirectory => ErrorCode::NotDirectory,
                io::ErrorKind::IsADirectory => ErrorCode::IsDirectory,
                io::ErrorKind::DirectoryNotEmpty => ErrorCode::NotEmpty,
                io::ErrorKind::ReadOnlyFilesystem => ErrorCode::ReadOnly,
                io::ErrorKind::Unsupported => ErrorCode::Unsupported,
                io::ErrorKind::Interrupted => ErrorCode::Interrupted,
                io::ErrorKind::OutOfMemory => ErrorCode::InsufficientMemory,
                io::ErrorKind::StorageFull => ErrorCode::InsufficientSpace,
                io::ErrorKind::CrossesDevices => ErrorCode::CrossDevice,
                io::ErrorKind::BrokenPipe => ErrorCode::Pipe,
                _ => ErrorCode::Io,
            },
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> FsError {
        match ErrorCode::from(&err) {
            ErrorCode::Io => {
                tracing::debug!("mapping unrecognized filesystem error to `io`: {err:?}");
                FsError::with_detail(ErrorCode::Io, err.to_string())
            }
            code => FsError::new(code),
        }
    }
}

impl From<rustix::io::Errno> for FsError {
    fn from(err: rustix::io::Errno) -> FsError {
        io::Error::from(err).into()
    }
}

impl From<std::num::TryFromIntError> for FsError {
    fn from(_: std::num::TryFromIntError) -> FsError {
        ErrorCode::Overflow.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn errno_maps_to_tag() {
        let err = io::Error::from_raw_os_error(rustix::io::Errno::NOENT.raw_os_error());
        assert_eq!(*FsError::from(err).code(), ErrorCode::NoEntry);
        let err = io::Error::from_raw_os_error(rustix::io::Errno::XDEV.raw_os_error());
        assert_eq!(*FsError::from(err).code(), ErrorCode::CrossDevice);
    }

    #[test]
    fn kind_is_used_without_errno() {
        let err = io::Error::new(io::ErrorKind::AlreadyExists, "exists");
        assert_eq!(*FsError::from(err).code(), ErrorCode::Exist);
    }

    #[test]
    fn unmapped_errors_keep_their_message() {
        let err = io::Error::other("gremlins");
        let err = FsError::from(err);
        assert_eq!(*err.code(), ErrorCode::Io);
        assert_eq!(err.detail(), Some("gremlins"));
        assert_eq!(err.to_string(), "io: gremlins");
    }
}
