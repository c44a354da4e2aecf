//! Error types for the recovery workers

use a2pc_backend::BackendError;
use a2pc_common::Xid;
use a2pc_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The row no longer matches what the transaction left behind
    #[error("Data changed under {xid}: {lock_key} on {node}.{table}: {detail}")]
    DataChanged {
        xid: Xid,
        node: String,
        table: String,
        lock_key: String,
        detail: String,
    },

    #[error("Unusable compensation record of {xid} for {lock_key} on {node}.{table}: {reason}")]
    CorruptLog {
        xid: Xid,
        node: String,
        table: String,
        lock_key: String,
        reason: String,
    },
}

impl RecoveryError {
    /// Integrity incidents leave the transaction stuck for inspection
    pub fn is_integrity_incident(&self) -> bool {
        matches!(
            self,
            Self::DataChanged { .. }
                | Self::CorruptLog { .. }
                | Self::Store(StoreError::LockConflict { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
