//! Error types for LFS server operations.

use thiserror::Error;

use crate::lock::Lock;

/// Result type for LFS server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while storing, negotiating or transferring LFS objects.
#[derive(Error, Debug)]
pub enum Error {
    /// Pointer fails validation (OID format or negative size)
    #[error("invalid LFS pointer: {0}")]
    InvalidPointer(String),

    /// Malformed `Range` or `Content-Range` value
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Storage path escapes the backend root or is otherwise unusable
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Malformed request argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Path does not exist in the storage backend
    #[error("object does not exist: {0}")]
    NotExist(String),

    /// Object, lock or repository not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Received byte count differs from the declared size
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: i64, actual: i64 },

    /// Content digest differs from the declared OID
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Client supplied chunk checksum does not match the received bytes
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Requested start offset lies at or beyond the end of the object
    #[error("range not satisfiable: offset {from} of {size} bytes")]
    RangeNotSatisfiable { from: i64, size: i64 },

    /// Object larger than the configured maximum
    #[error("size must be less than or equal to {max}, got {size}")]
    TooLarge { size: i64, max: i64 },

    /// Lock creation conflicts with an existing lock
    #[error("lock already exists for path {}", .0.path)]
    LockConflict(Box<Lock>),

    /// Missing or invalid credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credentials valid but insufficient
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Backend cannot produce direct URLs
    #[error("URL not supported by this storage backend")]
    UrlNotSupported,

    /// Operation cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// Remote storage returned an error
    #[error("storage error: {0}")]
    Storage(String),

    /// Pktline framing error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Whether this error means "the object is not there".
    pub fn is_not_exist(&self) -> bool {
        match self {
            Error::NotExist(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Unwrap an error smuggled through `std::io::Error` by a reader.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<Error>())
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(err) = inner.downcast::<Error>() {
                    return *err;
                }
            }
            return Error::Storage("reader failed".into());
        }
        Error::Io(err)
    }

    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            Error::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Error::NotExist(path),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(404, response) => Error::NotExist(response.get_url().to_string()),
            ureq::Error::Status(code @ (401 | 403), _) => {
                Error::PermissionDenied(format!("storage backend returned {}", code))
            }
            ureq::Error::Status(code, response) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| "unknown error".into());
                Error::Storage(format!("status {}: {}", code, message.trim()))
            }
            other => Error::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_roundtrip_preserves_variant() {
        let io = Error::SizeMismatch {
            expected: 10,
            actual: 8,
        }
        .into_io();
        match Error::from_io(io) {
            Error::SizeMismatch { expected, actual } => {
                assert_eq!(expected, 10);
                assert_eq!(actual, 8);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_plain_io_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::from_io(io);
        assert!(err.is_not_exist());
    }

    #[test]
    fn test_object_store_not_found_is_not_exist() {
        let err: Error = object_store::Error::NotFound {
            path: "lfs/ab/cd/ef".into(),
            source: "missing".into(),
        }
        .into();
        assert!(matches!(&err, Error::NotExist(path) if path == "lfs/ab/cd/ef"));

        let err: Error = object_store::Error::NotImplemented.into();
        assert!(matches!(err, Error::Storage(_)));
    }
}
