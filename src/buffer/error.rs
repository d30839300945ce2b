//! Error types for buffer store operations

use thiserror::Error;

use super::schema::ValidationError;

/// Result type alias for buffer operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing the buffer
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage location could not be opened
    #[error("failed to open buffer store: {0}")]
    ConnectionFailed(String),

    /// A query or transaction failed
    #[error("buffer query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("buffer migration failed: {0}")]
    MigrationFailed(String),

    /// Payload or context could not be (de)serialized
    #[error("record serialization error: {0}")]
    SerializationError(String),

    /// A record failed validation on enqueue
    #[error("invalid record: {0}")]
    Validation(#[from] ValidationError),

    /// A stored row could not be turned back into a record
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// I/O error (file access, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => StorageError::Io(io_err),
            sqlx::Error::RowNotFound => StorageError::QueryFailed("no rows found".to_string()),
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}
