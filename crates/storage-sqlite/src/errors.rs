use fieldsync_core::errors::Error;
use log::error;
use thiserror::Error;

/// Failures of the SQLite layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Database connection failed: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Database file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Writer actor is not running")]
    WriterClosed,

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A domain error raised inside a write transaction, passed through unchanged.
    #[error(transparent)]
    Core(Error),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Core(inner) => inner,
            other => {
                error!("[LocalStore] {}", other);
                Error::StorageIo(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_pass_through_unchanged() {
        let err: Error = StorageError::Core(Error::invalid_payload("bad")).into();
        assert!(matches!(err, Error::InvalidPayload(_)));

        let err: Error = StorageError::WriterClosed.into();
        assert!(matches!(err, Error::StorageIo(_)));
    }
}
