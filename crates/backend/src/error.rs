//! Error types for shard execution

use thiserror::Error;

/// Duplicate entry for a unique key
pub const ER_DUP_ENTRY: u32 = 1062;

/// Lock wait timeout exceeded
pub const ER_LOCK_WAIT_TIMEOUT: u32 = 1205;

/// Backend error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Error reported by the shard itself
    #[error("({code}) {message}")]
    Shard { code: u32, message: String },

    #[error("Timed out acquiring a connection to {0}")]
    AcquireTimeout(String),

    #[error("Unknown backend node: {0}")]
    UnknownNode(String),

    #[error("No transaction in progress")]
    NoTransaction,

    #[error("Transaction already in progress")]
    AlreadyInTransaction,
}

impl BackendError {
    pub fn shard(code: u32, message: impl Into<String>) -> Self {
        Self::Shard {
            code,
            message: message.into(),
        }
    }

    /// Numeric code passed through to clients
    pub fn code(&self) -> u32 {
        match self {
            Self::Shard { code, .. } => *code,
            Self::AcquireTimeout(_) => 2013,
            Self::UnknownNode(_) => 2005,
            Self::NoTransaction | Self::AlreadyInTransaction => 1399,
        }
    }

    pub fn is_lock_wait_timeout(&self) -> bool {
        self.code() == ER_LOCK_WAIT_TIMEOUT
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.code() == ER_DUP_ENTRY
    }
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;
