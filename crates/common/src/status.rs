//! Transaction status and logged operation kinds

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Authoritative status of a transaction.
///
/// Stored as an integer in the transaction table. The only legal transitions
/// are ACTIVE -> COMMIT, ACTIVE -> ROLLBACKING and ROLLBACKING -> ROLLBACKED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum TransactionStatus {
    Active = 1,
    Commit = 2,
    Rollbacking = 3,
    Rollbacked = 4,
}

impl TransactionStatus {
    /// Integer representation as persisted
    pub fn code(&self) -> i64 {
        *self as i64
    }

    /// Whether the transaction has reached a terminal status.
    ///
    /// Locks owned by a resolved transaction may be stolen.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Commit | Self::Rollbacked)
    }

    /// Whether the transaction still owns its locks
    pub fn is_live(&self) -> bool {
        !self.is_resolved()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Commit => "COMMIT",
            Self::Rollbacking => "ROLLBACKING",
            Self::Rollbacked => "ROLLBACKED",
        }
    }
}

impl From<TransactionStatus> for i64 {
    fn from(status: TransactionStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i64> for TransactionStatus {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Active),
            2 => Ok(Self::Commit),
            3 => Ok(Self::Rollbacking),
            4 => Ok(Self::Rollbacked),
            other => Err(Error::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of write recorded in a compensation log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(Error::UnknownOperation(s.to_string())),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TransactionStatus::Active.code(), 1);
        assert_eq!(TransactionStatus::Commit.code(), 2);
        assert_eq!(TransactionStatus::Rollbacking.code(), 3);
        assert_eq!(TransactionStatus::Rollbacked.code(), 4);
        assert_eq!(
            TransactionStatus::try_from(3),
            Ok(TransactionStatus::Rollbacking)
        );
        assert_eq!(TransactionStatus::try_from(9), Err(Error::UnknownStatus(9)));
    }

    #[test]
    fn test_resolved() {
        assert!(!TransactionStatus::Active.is_resolved());
        assert!(TransactionStatus::Commit.is_resolved());
        assert!(!TransactionStatus::Rollbacking.is_resolved());
        assert!(TransactionStatus::Rollbacked.is_resolved());
    }

    #[test]
    fn test_status_serializes_as_integer() {
        let json = serde_json::to_string(&TransactionStatus::Commit).unwrap();
        assert_eq!(json, "2");
        let status: TransactionStatus = serde_json::from_str("4").unwrap();
        assert_eq!(status, TransactionStatus::Rollbacked);
        assert!(serde_json::from_str::<TransactionStatus>("7").is_err());
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(
            serde_json::to_string(&Operation::Delete).unwrap(),
            "\"DELETE\""
        );
        assert_eq!("update".parse::<Operation>(), Ok(Operation::Update));
        assert!("UPSERT".parse::<Operation>().is_err());
    }
}
