//! Error types for the store

use a2pc_backend::BackendError;
use thiserror::Error;

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// More than one lock row for a single key
    #[error("Multiple lock rows for key {lock_key} on {node}.{table}: {count}")]
    LockConflict {
        lock_key: String,
        node: String,
        table: String,
        count: usize,
    },

    #[error("Lock row vanished for key {0}")]
    LockRowMissing(String),

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No partitions configured")]
    NoPartitions,
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
