use thiserror::Error;
use tokio::task::JoinError;

use crate::BlockId;

/// Errors surfaced by the block store, the forest and the synchronizer.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// A block, label or path is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication or hash verification failed while decoding a block.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A block or node could not be parsed.
    #[error("format error: {0}")]
    Format(String),

    /// A reference was released more often than it was taken.
    #[error("refcount underflow on {0}")]
    RefcountUnderflow(BlockId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("only a single link per file is supported")]
    LinkLimit,
}

impl Error {
    /// Whether this error means the stored data itself is unusable.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Integrity(_) | Error::Format(_))
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<crate::digests::Error> for Error {
    fn from(value: crate::digests::Error) -> Self {
        Error::Format(value.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Error::Format(value.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(value: sled::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::InvalidInput => Error::InvalidRequest(value.to_string()),
            std::io::ErrorKind::NotFound => Error::NotFound(value.to_string()),
            _ => Error::StorageError(value.to_string()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        use std::io::ErrorKind;

        let kind = match &value {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidRequest(_) => ErrorKind::InvalidInput,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::LinkLimit => ErrorKind::Unsupported,
            Error::NotADirectory(_) | Error::IsADirectory(_) => ErrorKind::InvalidInput,
            Error::Integrity(_)
            | Error::Format(_)
            | Error::RefcountUnderflow(_)
            | Error::StorageError(_) => ErrorKind::Other,
        };
        std::io::Error::new(kind, value)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use std::io;

    #[test]
    fn io_mapping() {
        let e: io::Error = Error::NotFound("/a".into()).into();
        assert_eq!(io::ErrorKind::NotFound, e.kind());

        let e: io::Error = Error::Integrity("tag mismatch".into()).into();
        assert_eq!(io::ErrorKind::Other, e.kind());

        let e: io::Error = Error::LinkLimit.into();
        assert_eq!(io::ErrorKind::Unsupported, e.kind());
    }
}
