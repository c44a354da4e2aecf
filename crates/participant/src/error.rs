//! Error types for the participant

use crate::ParticipantState;
use a2pc_backend::BackendError;
use a2pc_client::{ClientError, status};
use a2pc_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParticipantError {
    #[error("Cannot {operation} in state {state:?}")]
    InvalidState {
        state: ParticipantState,
        operation: &'static str,
    },

    #[error("Statement not handled by transactions: {0}")]
    UnsupportedStatement(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Invalid table configuration for {table}: {reason}")]
    InvalidTable { table: String, reason: String },

    #[error("SQL needs to contain the sharding column {column} of {table}")]
    MissingShardingColumn { table: String, column: String },

    #[error("Sharding column {column} of {table} is not an integer")]
    InvalidShardingValue { table: String, column: String },

    #[error("No backend numbered {number} for table {table}")]
    NoBackend { table: String, number: i64 },

    #[error("Locking {table} needs the {column} column")]
    MissingLockColumn { table: String, column: String },

    #[error("Lock column {column} of {table} cannot be assigned")]
    LockColumnAssigned { table: String, column: String },

    #[error("{table}: expected at most one row for lock key {lock_key}, got {rows}")]
    NotUnique {
        table: String,
        lock_key: String,
        rows: usize,
    },

    #[error("Row {lock_key} of {table} changed since it was captured")]
    ImageMismatch { table: String, lock_key: String },

    #[error("Lock acquisition timed out: {lock_key} on {node}.{table} after {attempts} attempts")]
    LockTimeout {
        lock_key: String,
        node: String,
        table: String,
        attempts: u32,
    },

    #[error(transparent)]
    Coordinator(#[from] ClientError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ParticipantError {
    /// Status code to surface to SQL clients
    pub fn code(&self) -> u32 {
        match self {
            Self::LockTimeout { .. } => status::LOCK_TIMEOUT,
            Self::Coordinator(err) => err.code(),
            Self::Backend(err) => err.code(),
            Self::Store(StoreError::Backend(err)) => err.code(),
            _ => status::INTERNAL,
        }
    }

    /// Whether the statement may succeed if issued again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::Backend(err) => err.is_lock_wait_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ParticipantError>;
