//! Portable error taxonomy
//!
//! Host errno values never escape the storage engine. Every failure is
//! translated into one of the error kinds below; completion states carry the
//! kind and tools translate it into a human-readable message. Undefined errno
//! inputs map to [`StorageError::Unknown`] rather than surfacing the host
//! integer.

use std::io;

/// Error kinds surfaced by the storage engine.
///
/// Errors encountered inside a service routine are reported as the
/// operation's completion status, not as a post-time return. Post-time
/// failures (bad handle, unknown collection, exhausted contexts) surface
/// synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid argument")]
    Invalid,
    #[error("no space left on device")]
    NoSpace,
    #[error("permission denied")]
    PermissionDenied,
    #[error("resource busy")]
    Busy,
    #[error("out of memory")]
    NoMemory,
    #[error("value too large")]
    TooLarge,
    #[error("interrupted")]
    Interrupted,
    #[error("I/O error")]
    Io,
    #[error("operation not supported")]
    NotSupported,
    #[error("timed out")]
    TimedOut,
    #[error("operation canceled")]
    Canceled,
    #[error("incompatible storage format version")]
    IncompatibleVersion,
    #[error("corrupt on-disk state")]
    CorruptState,
    #[error("unknown error")]
    Unknown,
}

impl StorageError {
    /// Map a host errno value to a portable error kind.
    pub fn from_errno(errno: i32) -> StorageError {
        match errno {
            libc::ENOENT => StorageError::NotFound,
            libc::EEXIST => StorageError::AlreadyExists,
            libc::EINVAL | libc::EBADF | libc::EFAULT => StorageError::Invalid,
            libc::ENOSPC | libc::EDQUOT => StorageError::NoSpace,
            libc::EPERM | libc::EACCES | libc::EROFS => StorageError::PermissionDenied,
            libc::EBUSY | libc::EAGAIN | libc::EDEADLK => StorageError::Busy,
            libc::ENOMEM => StorageError::NoMemory,
            libc::EFBIG | libc::EOVERFLOW | libc::EMSGSIZE => StorageError::TooLarge,
            libc::EINTR => StorageError::Interrupted,
            libc::EIO | libc::ENXIO | libc::ENODEV | libc::EPIPE => StorageError::Io,
            libc::ENOSYS | libc::EOPNOTSUPP => StorageError::NotSupported,
            libc::ETIMEDOUT | libc::ETIME => StorageError::TimedOut,
            libc::ECANCELED => StorageError::Canceled,
            _ => StorageError::Unknown,
        }
    }

    /// Map the calling thread's current errno.
    pub fn last_os_error() -> StorageError {
        StorageError::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> StorageError {
        match err.raw_os_error() {
            Some(errno) => StorageError::from_errno(errno),
            None => match err.kind() {
                io::ErrorKind::NotFound => StorageError::NotFound,
                io::ErrorKind::AlreadyExists => StorageError::AlreadyExists,
                io::ErrorKind::PermissionDenied => StorageError::PermissionDenied,
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => StorageError::Invalid,
                io::ErrorKind::TimedOut => StorageError::TimedOut,
                io::ErrorKind::Interrupted => StorageError::Interrupted,
                _ => StorageError::Io,
            },
        }
    }
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> StorageError {
        match err {
            sled::Error::Io(io_err) => io_err.into(),
            sled::Error::CollectionNotFound(_) => StorageError::NotFound,
            sled::Error::Corruption { .. } => StorageError::CorruptState,
            sled::Error::ReportableBug(_) => StorageError::Unknown,
            sled::Error::Unsupported(_) => StorageError::NotSupported,
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(_: bincode::Error) -> StorageError {
        StorageError::CorruptState
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(StorageError::from_errno(libc::ENOENT), StorageError::NotFound);
        assert_eq!(StorageError::from_errno(libc::EEXIST), StorageError::AlreadyExists);
        assert_eq!(StorageError::from_errno(libc::ENOSPC), StorageError::NoSpace);
        assert_eq!(StorageError::from_errno(libc::EACCES), StorageError::PermissionDenied);
        assert_eq!(StorageError::from_errno(libc::EIO), StorageError::Io);
        assert_eq!(StorageError::from_errno(libc::ETIMEDOUT), StorageError::TimedOut);
    }

    #[test]
    fn test_undefined_errno_is_unknown() {
        assert_eq!(StorageError::from_errno(0), StorageError::Unknown);
        assert_eq!(StorageError::from_errno(-1), StorageError::Unknown);
        assert_eq!(StorageError::from_errno(9999), StorageError::Unknown);
    }

    #[test]
    fn test_io_error_conversion() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(StorageError::from(err), StorageError::NotFound);

        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(StorageError::from(err), StorageError::Io);
    }
}
