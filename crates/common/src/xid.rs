//! Transaction identifier
//!
//! An xid is a snowflake id handed out by the coordinator on BEGIN. Its numeric
//! value orders transactions by creation time and selects the partition that
//! owns the transaction record.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique, time-ordered transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Xid(u64);

impl Xid {
    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Partition owning this transaction out of `partitions`
    pub fn partition(&self, partitions: usize) -> usize {
        debug_assert!(partitions > 0);
        (self.0 % partitions as u64) as usize
    }

    /// Parse from the decimal string representation
    pub fn parse(s: &str) -> Result<Self, String> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| format!("Invalid transaction ID: {}", e))
    }
}

impl From<u64> for Xid {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_modulo() {
        assert_eq!(Xid::new(1001).partition(4), 1);
        assert_eq!(Xid::new(1004).partition(4), 0);
        assert_eq!(Xid::new(7).partition(1), 0);
    }

    #[test]
    fn test_roundtrip() {
        let xid = Xid::new(420_000_123);
        let parsed = Xid::parse(&xid.to_string()).unwrap();
        assert_eq!(xid, parsed);
        assert!(Xid::parse("not-a-number").is_err());
    }

    #[test]
    fn test_serializes_as_plain_integer() {
        let json = serde_json::to_string(&Xid::new(2001)).unwrap();
        assert_eq!(json, "2001");
        let back: Xid = serde_json::from_str("2001").unwrap();
        assert_eq!(back, Xid::new(2001));
    }
}
