//! Error types for coordinator clients

use a2pc_coordinator::protocol::status;
use thiserror::Error;

/// Client error types
#[derive(Error, Debug)]
pub enum ClientError {
    /// The coordinator answered with a non-zero status
    #[error("coordinator error {status}: {message}")]
    Coordinator { status: u32, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed coordinator response: {0}")]
    MalformedResponse(String),

    #[error("No coordinator replicas configured")]
    NoReplicas,
}

impl ClientError {
    /// Status code to surface to SQL clients
    pub fn code(&self) -> u32 {
        match self {
            Self::Coordinator { status, .. } => *status,
            Self::Transport(_) | Self::MalformedResponse(_) | Self::NoReplicas => status::INTERNAL,
        }
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
