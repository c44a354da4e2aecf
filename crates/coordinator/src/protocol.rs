//! Wire protocol of the coordinator
//!
//! Every call is a JSON object with an `action` field, sent as the body of
//! `PUT /transactions`. Every answer carries a numeric `status`, zero on
//! success.

use a2pc_common::{LockKey, Xid};
use serde::{Deserialize, Serialize};

/// Response status codes
pub mod status {
    pub const OK: u32 = 0;
    pub const INTERNAL: u32 = 1000;
    pub const UNKNOWN_ACTION: u32 = 1001;
    pub const TRANSACTION_NOT_FOUND: u32 = 1002;
    pub const TRANSACTION_INVALID_STATE: u32 = 1003;
    /// Lock held by a live transaction; retry later
    pub const LOCK_BUSY: u32 = 1004;
    /// Retry budget for a busy lock exhausted
    pub const LOCK_TIMEOUT: u32 = 1005;
    /// More than one lock row for a key
    pub const LOCK_CONFLICT: u32 = 100001;
}

/// Request body of `PUT /transactions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Begin {
        #[serde(default)]
        client_id: String,
    },
    Commit {
        xid: Xid,
    },
    Rollback {
        xid: Xid,
    },
    AcquireLock {
        xid: Xid,
        node: String,
        table: String,
        lock_key: LockKey,
        #[serde(default)]
        context: String,
    },
}

impl Request {
    /// Transaction addressed by the request, if any
    pub fn xid(&self) -> Option<Xid> {
        match self {
            Request::Begin { .. } => None,
            Request::Commit { xid } | Request::Rollback { xid } => Some(*xid),
            Request::AcquireLock { xid, .. } => Some(*xid),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Request::Begin { .. } => "BEGIN",
            Request::Commit { .. } => "COMMIT",
            Request::Rollback { .. } => "ROLLBACK",
            Request::AcquireLock { .. } => "ACQUIRE_LOCK",
        }
    }
}

/// Response body of `PUT /transactions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<Xid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok(xid: Xid) -> Self {
        Self {
            status: status::OK,
            xid: Some(xid),
            message: None,
        }
    }

    pub fn busy(xid: Xid) -> Self {
        Self {
            status: status::LOCK_BUSY,
            xid: Some(xid),
            message: None,
        }
    }

    pub fn error(status: u32, xid: Option<Xid>, message: impl Into<String>) -> Self {
        Self {
            status,
            xid,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }

    pub fn is_busy(&self) -> bool {
        self.status == status::LOCK_BUSY
    }
}
