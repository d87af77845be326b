//! Error taxonomy of the engine and its translation to errno.

use thiserror::Error;
use tracing::warn;

use crate::path::InvalidPathError;

/// A fault reported by a remote store call, carrying a transport-level status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("remote store call failed with status {status}")]
pub struct RemoteFault {
    /// HTTP-status-shaped code, or a backend-specific code above 999.
    pub status: u16,
}

impl RemoteFault {
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    /// The storage client library's own "object does not exist" code.
    pub const CLIENT_NOT_FOUND: u16 = 1600;

    #[must_use]
    pub const fn new(status: u16) -> Self {
        Self { status }
    }

    #[must_use]
    pub const fn not_found() -> Self {
        Self::new(Self::NOT_FOUND)
    }

    #[must_use]
    pub const fn is_not_found(self) -> bool {
        matches!(self.status, Self::NOT_FOUND | Self::CLIENT_NOT_FOUND)
    }
}

/// Every failure the engine surfaces to the filesystem driver.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("remote store fault (status {0})")]
    TransportFault(u16),

    #[error("local io error: {0}")]
    LocalIo(#[from] std::io::Error),

    #[error("resource is locked by another handle")]
    Contention,

    #[error("operation not supported")]
    Unsupported,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("unknown file handle {0}")]
    BadHandle(u64),
}

impl From<RemoteFault> for FsError {
    fn from(fault: RemoteFault) -> Self {
        match fault.status {
            RemoteFault::NOT_FOUND | RemoteFault::CLIENT_NOT_FOUND => Self::NotFound,
            RemoteFault::FORBIDDEN => Self::PermissionDenied,
            status => {
                warn!(status, "remote status has no errno mapping, reporting EIO");
                Self::TransportFault(status)
            }
        }
    }
}

impl From<InvalidPathError> for FsError {
    fn from(_: InvalidPathError) -> Self {
        Self::InvalidArgument
    }
}

impl From<nix::errno::Errno> for FsError {
    fn from(errno: nix::errno::Errno) -> Self {
        if errno == nix::errno::Errno::EWOULDBLOCK {
            Self::Contention
        } else {
            Self::LocalIo(std::io::Error::from(errno))
        }
    }
}

impl FsError {
    /// The errno this error is reported as.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::TransportFault(_) => libc::EIO,
            Self::LocalIo(e) => io_to_errno(e),
            Self::Contention => libc::EWOULDBLOCK,
            Self::Unsupported => libc::ENOSYS,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::InvalidArgument => libc::EINVAL,
            Self::BadHandle(_) => libc::EBADF,
        }
    }

    /// Whether this error means the path does not exist, locally or remotely.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        if let Self::LocalIo(e) = self {
            return e.kind() == std::io::ErrorKind::NotFound;
        }
        matches!(self, Self::NotFound)
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        e.errno()
    }
}

/// Convert an I/O error to the corresponding errno value.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
#[must_use]
pub fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        std::io::ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
        std::io::ErrorKind::WouldBlock => libc::EWOULDBLOCK,
        _ => libc::EIO,
    })
}

/// Result alias used across the engine.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_table() {
        assert_eq!(i32::from(FsError::from(RemoteFault::new(404))), libc::ENOENT);
        assert_eq!(i32::from(FsError::from(RemoteFault::new(403))), libc::EACCES);
        assert_eq!(i32::from(FsError::from(RemoteFault::new(1600))), libc::ENOENT);
    }

    #[test]
    fn unmapped_status_degrades_to_eio() {
        let err = FsError::from(RemoteFault::new(503));
        assert!(matches!(err, FsError::TransportFault(503)));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn local_io_keeps_raw_os_error() {
        let err = FsError::from(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.errno(), libc::ENOSPC);
    }

    #[test]
    fn would_block_is_contention() {
        let err = FsError::from(nix::errno::Errno::EWOULDBLOCK);
        assert!(matches!(err, FsError::Contention));
    }

    #[test]
    fn not_found_covers_local_io() {
        let err = FsError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(!FsError::Unsupported.is_not_found());
    }
}
