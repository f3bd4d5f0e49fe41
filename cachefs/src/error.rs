use std::io;
use thiserror::Error;

/// Failures surfaced by every layer of the filesystem.
///
/// Structural and validation errors are returned at the point of violation and
/// are never retried. `ConnectivityLost` is the only transient class; the
/// reconnect coordinator reacts to it, callers retry on a fresh handle.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("directory is not empty: {0}")]
    NotEmpty(String),

    #[error("file is already opened for writing: {0}")]
    AlreadyInUse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("handle is closed")]
    Closed,

    #[error("connectivity lost: {0}")]
    ConnectivityLost(String),

    #[error("operation is not supported: {0}")]
    Unsupported(String),

    #[error("secondary filesystem I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("record encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, FsError::ConnectivityLost(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            FsError::NotFound(_) => io::ErrorKind::NotFound,
            FsError::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            FsError::NotEmpty(_) => io::ErrorKind::DirectoryNotEmpty,
            FsError::AlreadyInUse(_) => io::ErrorKind::ResourceBusy,
            FsError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            FsError::NotADirectory(_) => io::ErrorKind::NotADirectory,
            FsError::IsADirectory(_) => io::ErrorKind::IsADirectory,
            FsError::Closed => io::ErrorKind::BrokenPipe,
            FsError::ConnectivityLost(_) => io::ErrorKind::ConnectionAborted,
            FsError::Unsupported(_) => io::ErrorKind::Unsupported,
            FsError::Io(e) => e.kind(),
            FsError::Codec(_) => io::ErrorKind::InvalidData,
        }
    }
}

impl From<FsError> for io::Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let busy: io::Error = FsError::AlreadyInUse("/f".into()).into();
        assert_eq!(busy.kind(), io::ErrorKind::ResourceBusy);

        let lost: io::Error = FsError::ConnectivityLost("gone".into()).into();
        assert_eq!(lost.kind(), io::ErrorKind::ConnectionAborted);

        let inner = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let passthrough: io::Error = FsError::Io(inner).into();
        assert_eq!(passthrough.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_classification() {
        assert!(FsError::ConnectivityLost("x".into()).is_connectivity());
        assert!(!FsError::Closed.is_connectivity());
        assert!(FsError::NotFound("/x".into()).is_not_found());
    }
}
