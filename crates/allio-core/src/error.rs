//! allio error codes.
//!
//! One flat enum covers library conditions and wraps platform codes
//! (errno on unix, Win32 error codes on Windows) in `System`. Operation
//! results carry this type; nothing in the core panics or unwinds for
//! control flow.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    UnknownFailure,
    InvalidArgument,
    ArgumentStringTooLong,
    NotEnoughMemory,
    NoBufferSpace,
    FilenameTooLong,

    /// The operation has not produced a result yet.
    AsyncOperationPending,
    /// Cancellation, not a competing completion, ended the operation.
    AsyncOperationCancelled,
    /// Cancel or poll on an operation that was never started.
    AsyncOperationNotInProgress,
    AsyncOperationTimedOut,

    UnsupportedOperation,
    InvalidEncoding,
    UnsupportedEncoding,
    /// No implementation for this (multiplexer, object, operation) triple.
    UnsupportedMultiplexerHandleRelation,
    UnsupportedAsynchronousOperation,
    UnsupportedPageLevel,
    /// Backend queue exhausted (e.g. io_uring submission queue full).
    TooManyConcurrentAsyncOperations,

    HandleIsNull,
    HandleIsNotNull,
    HandleIsNotMultiplexable,
    MultiplexerIsNull,

    ProcessArgumentsTooLong,
    /// Waiting on the calling process would never complete.
    ProcessIsCurrentProcess,
    ProcessExitCodeNotAvailable,

    InvalidPath,
    InvalidCurrentDirectory,
    DirectoryStreamAtEnd,
    VirtualAddressNotAvailable,
    InvalidAddress,
    CommandLineTooLong,
    SocketAlreadyBound,

    /// Platform error code (errno / GetLastError).
    System(i32),
}

impl Error {
    /// Wrap a platform error code, mapping the codes that have a
    /// dedicated variant.
    pub fn from_errno(code: i32) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                match code {
                    libc::ECANCELED => Error::AsyncOperationCancelled,
                    libc::ETIME | libc::ETIMEDOUT => Error::AsyncOperationTimedOut,
                    libc::ENOMEM => Error::NotEnoughMemory,
                    libc::ENOBUFS => Error::NoBufferSpace,
                    libc::ENAMETOOLONG => Error::FilenameTooLong,
                    libc::E2BIG => Error::ProcessArgumentsTooLong,
                    _ => Error::System(code),
                }
            } else if #[cfg(windows)] {
                // ERROR_OPERATION_ABORTED, WAIT_TIMEOUT, ERROR_NOT_ENOUGH_MEMORY
                match code {
                    995 => Error::AsyncOperationCancelled,
                    258 | 1460 => Error::AsyncOperationTimedOut,
                    8 | 14 => Error::NotEnoughMemory,
                    _ => Error::System(code),
                }
            } else {
                Error::System(code)
            }
        }
    }

    /// The calling thread's last platform error.
    pub fn last_os_error() -> Self {
        std::io::Error::last_os_error().into()
    }

    /// The wrapped platform code, if this is a passthrough error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::System(code) => Some(*code),
            _ => None,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::AsyncOperationCancelled)
    }

    #[inline]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::AsyncOperationTimedOut)
    }

    /// True for errno values that mean "retry once the handle is ready".
    pub fn is_would_block(&self) -> bool {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                matches!(self, Error::System(c) if *c == libc::EAGAIN || *c == libc::EWOULDBLOCK)
            } else {
                false
            }
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Error::UnknownFailure => "unknown failure",
            Error::InvalidArgument => "invalid argument",
            Error::ArgumentStringTooLong => "argument string too long",
            Error::NotEnoughMemory => "not enough memory",
            Error::NoBufferSpace => "no buffer space",
            Error::FilenameTooLong => "filename too long",
            Error::AsyncOperationPending => "async operation pending",
            Error::AsyncOperationCancelled => "async operation cancelled",
            Error::AsyncOperationNotInProgress => "async operation not in progress",
            Error::AsyncOperationTimedOut => "async operation timed out",
            Error::UnsupportedOperation => "unsupported operation",
            Error::InvalidEncoding => "invalid encoding",
            Error::UnsupportedEncoding => "unsupported encoding",
            Error::UnsupportedMultiplexerHandleRelation => "unsupported multiplexer handle relation",
            Error::UnsupportedAsynchronousOperation => "unsupported asynchronous operation",
            Error::UnsupportedPageLevel => "unsupported page level",
            Error::TooManyConcurrentAsyncOperations => "too many concurrent async operations",
            Error::HandleIsNull => "handle is null",
            Error::HandleIsNotNull => "handle is not null",
            Error::HandleIsNotMultiplexable => "handle is not multiplexable",
            Error::MultiplexerIsNull => "multiplexer is null",
            Error::ProcessArgumentsTooLong => "process arguments too long",
            Error::ProcessIsCurrentProcess => "process is current process",
            Error::ProcessExitCodeNotAvailable => "process exit code not available",
            Error::InvalidPath => "invalid path",
            Error::InvalidCurrentDirectory => "invalid current directory",
            Error::DirectoryStreamAtEnd => "directory stream at end",
            Error::VirtualAddressNotAvailable => "virtual address not available",
            Error::InvalidAddress => "invalid address",
            Error::CommandLineTooLong => "command line too long",
            Error::SocketAlreadyBound => "socket already bound",
            Error::System(_) => "system error",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::System(code) => write!(
                f,
                "system error {}: {}",
                code,
                std::io::Error::from_raw_os_error(*code)
            ),
            other => f.write_str(other.message()),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Error::from_errno(code),
            None => match e.kind() {
                std::io::ErrorKind::TimedOut => Error::AsyncOperationTimedOut,
                std::io::ErrorKind::InvalidInput => Error::InvalidArgument,
                std::io::ErrorKind::OutOfMemory => Error::NotEnoughMemory,
                _ => Error::UnknownFailure,
            },
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::System(code) => std::io::Error::from_raw_os_error(code),
            Error::AsyncOperationTimedOut => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, e)
            }
            Error::InvalidArgument | Error::InvalidAddress | Error::InvalidPath => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            }
            Error::UnsupportedOperation
            | Error::UnsupportedMultiplexerHandleRelation
            | Error::UnsupportedAsynchronousOperation => {
                std::io::Error::new(std::io::ErrorKind::Unsupported, e)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::HandleIsNull.to_string(), "handle is null");
        assert_eq!(
            Error::ProcessIsCurrentProcess.to_string(),
            "process is current process"
        );
        assert!(Error::System(2).to_string().starts_with("system error 2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::from_errno(libc::ECANCELED), Error::AsyncOperationCancelled);
        assert_eq!(Error::from_errno(libc::ETIME), Error::AsyncOperationTimedOut);
        assert_eq!(Error::from_errno(libc::ENOENT), Error::System(libc::ENOENT));
        assert!(Error::from_errno(libc::EAGAIN).is_would_block());
        assert!(!Error::AsyncOperationCancelled.is_would_block());
    }

    #[test]
    fn test_io_error_round_trip_keeps_code() {
        let e: Error = std::io::Error::from_raw_os_error(2).into();
        assert_eq!(e.raw_os_error(), Some(2));
        let back: std::io::Error = e.into();
        assert_eq!(back.raw_os_error(), Some(2));
    }

    #[test]
    fn test_timed_out_maps_to_io_kind() {
        let e: std::io::Error = Error::AsyncOperationTimedOut.into();
        assert_eq!(e.kind(), std::io::ErrorKind::TimedOut);
    }
}
