//! Error types for common primitives

use thiserror::Error;

/// Common error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Worker id {0} out of range (0..=31)")]
    InvalidWorkerId(u8),

    #[error("Datacenter id {0} out of range (0..=31)")]
    InvalidDatacenterId(u8),

    #[error("Unknown transaction status: {0}")]
    UnknownStatus(i64),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

/// Result type for common operations
pub type Result<T> = std::result::Result<T, Error>;
