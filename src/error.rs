//! Error kinds surfaced by the core, independent of the kernel bridge.

use std::fmt;
use std::io;

/// Error kinds the core surfaces upward (spec §7).
#[derive(Debug)]
pub enum FsError {
    /// Name not present in parent.
    NotFound,
    /// Name already present in parent (create/mkdir/symlink/link).
    Exists,
    /// Unsupported operation (mknod, fallocate, arbitrary truncate).
    NotImplemented,
    /// Access check failed.
    Permission,
    /// Operation on the wrong kind of node (e.g. readlink on non-link).
    Invalid,
    /// Log read/write failed.
    Io(io::Error),
    /// Metadata replay detected a missing `parent_id` or an unparseable
    /// record before EOF.
    Corrupt(String),
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::Exists => write!(f, "entry already exists"),
            FsError::NotImplemented => write!(f, "operation not implemented"),
            FsError::Permission => write!(f, "permission denied"),
            FsError::Invalid => write!(f, "invalid operation for this node kind"),
            FsError::Io(err) => write!(f, "log I/O error: {err}"),
            FsError::Corrupt(msg) => write!(f, "metadata log corrupt: {msg}"),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FsError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::Io(err)
    }
}

/// The raw errno `reply.error()` expects at the `fuser::Filesystem`
/// trait boundary (spec §7).
impl From<FsError> for libc::c_int {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotImplemented => libc::ENOSYS,
            FsError::Permission => libc::EACCES,
            FsError::Invalid => libc::EINVAL,
            FsError::Io(_) => libc::EIO,
            FsError::Corrupt(_) => libc::EIO,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
