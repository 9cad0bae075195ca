//! Error types for Spool

use thiserror::Error;

/// Main error type for Spool operations
#[derive(Error, Debug)]
pub enum SpoolError {
    /// Output configuration rejected at registration time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An output for this log kind is already registered on the spool
    #[error("Output already registered for kind: {0}")]
    DuplicateOutput(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// A stored row could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stored schema is newer than this build understands
    #[error("Unsupported schema version {found} (supported up to {supported})")]
    UnsupportedSchema { found: u64, supported: u64 },

    /// No tokio runtime available to drive timers
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The work queue has been shut down
    #[error("Work queue is shut down")]
    Shutdown,

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using SpoolError
pub type SpoolResult<T> = Result<T, SpoolError>;
