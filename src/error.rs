//! Error taxonomy shared by every layer of the network filesystem plane.
//!
//! Every RPC result is either a typed success value or exactly one of the
//! variants below — never both. POSIX-mappable variants are translated to
//! the matching `errno` at the FUSE boundary (see [`crate::fuse`]).

use std::fmt;

/// Closed sum of every error the core can produce or forward (spec §7).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    NotFound,
    PermissionDenied,
    NotADirectory,
    NotASymlink,
    NoSpace,
    BadHandle,
    Io,
    Timeout,
    Busy,
    Interrupted,
    ProtocolError,
    AuthFailed,
    Shutdown,
    CacheCorrupt,
}

impl Error {
    /// Whether this error is session-fatal (spec §7 "Propagation").
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProtocolError | Error::AuthFailed)
    }

    /// Whether a local retry with capped backoff is appropriate before the
    /// caller gives up and surfaces [`Error::Io`] instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout | Error::Busy)
    }

    /// Maps this error onto the closest POSIX `errno`, for the FUSE boundary.
    pub fn to_errno(self) -> libc::c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::PermissionDenied => libc::EACCES,
            Error::NotADirectory => libc::ENOTDIR,
            Error::NotASymlink => libc::EINVAL,
            Error::NoSpace => libc::ENOSPC,
            Error::BadHandle => libc::EBADF,
            Error::Io => libc::EIO,
            Error::Timeout => libc::EIO,
            Error::Busy => libc::EBUSY,
            Error::Interrupted => libc::EINTR,
            Error::ProtocolError => libc::EIO,
            Error::AuthFailed => libc::EACCES,
            Error::Shutdown => libc::ENODEV,
            Error::CacheCorrupt => libc::EIO,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "not found",
            Error::PermissionDenied => "permission denied",
            Error::NotADirectory => "not a directory",
            Error::NotASymlink => "not a symlink",
            Error::NoSpace => "no space left on device",
            Error::BadHandle => "bad handle",
            Error::Io => "I/O error",
            Error::Timeout => "operation timed out",
            Error::Busy => "server busy",
            Error::Interrupted => "interrupted",
            Error::ProtocolError => "protocol error",
            Error::AuthFailed => "authentication failed",
            Error::Shutdown => "session shut down",
            Error::CacheCorrupt => "cache corrupt",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Error::NotFound,
            ErrorKind::PermissionDenied => Error::PermissionDenied,
            ErrorKind::TimedOut => Error::Timeout,
            ErrorKind::Interrupted => Error::Interrupted,
            _ => Error::Io,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
