//! Error taxonomy for filesystem operations
//!
//! Everything the kernel sees collapses to a handful of errno values. The
//! underlying cause is logged where the error is produced.

use libc::c_int;

use common::reader::ReaderError;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("operation not supported")]
    NotSupported,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("file is disabled")]
    Disabled,
    #[error("file is not open")]
    NotOpen,
    #[error("failed to persist metadata: {0}")]
    Persist(String),
    #[error("reader error: {0}")]
    Reader(#[from] ReaderError),
}

impl FsError {
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::ReadOnly => libc::EROFS,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::PermissionDenied => libc::EPERM,
            FsError::Disabled | FsError::NotOpen | FsError::Persist(_) | FsError::Reader(_) => {
                libc::EIO
            }
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_failures_collapse_to_eio() {
        assert_eq!(FsError::Disabled.errno(), libc::EIO);
        assert_eq!(FsError::NotOpen.errno(), libc::EIO);
        assert_eq!(
            FsError::Reader(ReaderError::NotPrepared).errno(),
            libc::EIO
        );
    }

    #[test]
    fn test_fixed_codes() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::NotDirectory.errno(), libc::ENOTDIR);
        assert_eq!(FsError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(FsError::NotSupported.errno(), libc::ENOTSUP);
        assert_eq!(FsError::PermissionDenied.errno(), libc::EPERM);
    }
}
