//! Error types for the coordinator

use crate::protocol::status;
use a2pc_common::{TransactionStatus, Xid};
use a2pc_store::StoreError;
use thiserror::Error;

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("transaction {0} not found")]
    TransactionNotFound(Xid),

    #[error("transaction {xid} is {status}")]
    InvalidState {
        xid: Xid,
        status: TransactionStatus,
    },

    /// Lock table integrity incident
    #[error("multi lines: {0}")]
    LockConflict(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl CoordinatorError {
    /// Wire status code for this error
    pub fn code(&self) -> u32 {
        match self {
            Self::TransactionNotFound(_) => status::TRANSACTION_NOT_FOUND,
            Self::InvalidState { .. } => status::TRANSACTION_INVALID_STATE,
            Self::LockConflict(_) => status::LOCK_CONFLICT,
            Self::Store(StoreError::Backend(e)) => e.code(),
            Self::Store(_) => status::INTERNAL,
        }
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockConflict { .. } => Self::LockConflict(err.to_string()),
            other => Self::Store(other),
        }
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
