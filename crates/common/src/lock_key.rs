//! Canonical lock keys
//!
//! A lock key identifies a logical row by the values of its table's lock
//! columns. The canonical text form is the JSON object of those values with
//! keys in sorted order, so every participant derives the same key for the
//! same row regardless of predicate order.

use crate::{Row, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Row", into = "Row")]
pub struct LockKey {
    values: Row,
    canonical: String,
}

impl LockKey {
    pub fn new(values: Row) -> Self {
        let canonical = serde_json::to_string(&values).unwrap_or_default();
        Self { values, canonical }
    }

    /// Rebuild a key from its canonical text as stored in the lock table
    pub fn parse(canonical: &str) -> Result<Self, serde_json::Error> {
        let values: Row = serde_json::from_str(canonical)?;
        Ok(Self::new(values))
    }

    pub fn values(&self) -> &Row {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Integer value of the last six hex digits of the key's MD5 digest
    pub fn hash(&self) -> u64 {
        let digest = md5::compute(self.canonical.as_bytes());
        digest.0[13..]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
    }

    /// Lock table partition holding this key out of `partitions`
    pub fn partition(&self, partitions: usize) -> usize {
        debug_assert!(partitions > 0);
        (self.hash() % partitions as u64) as usize
    }
}

impl From<Row> for LockKey {
    fn from(values: Row) -> Self {
        Self::new(values)
    }
}

impl From<LockKey> for Row {
    fn from(key: LockKey) -> Self {
        key.values
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pairs: &[(&str, Value)]) -> LockKey {
        LockKey::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_canonical_form_is_order_independent() {
        let a = key(&[("id", 5.into()), ("region", "eu".into())]);
        let b = key(&[("region", "eu".into()), ("id", 5.into())]);
        assert_eq!(a.as_str(), r#"{"id":5,"region":"eu"}"#);
        assert_eq!(a.as_str(), b.as_str());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_uses_digest_tail() {
        let k = key(&[("id", 5.into())]);
        let hex = format!("{:x}", md5::compute(k.as_str().as_bytes()));
        let expected = u64::from_str_radix(&hex[26..], 16).unwrap();
        assert_eq!(k.hash(), expected);
        assert!(k.hash() < (1 << 24));
        assert_eq!(k.partition(4), (expected % 4) as usize);
    }

    #[test]
    fn test_parse_and_wire_form() {
        let k = key(&[("id", 7.into())]);
        let parsed = LockKey::parse(k.as_str()).unwrap();
        assert_eq!(parsed, k);

        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, r#"{"id":7}"#);
        let back: LockKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("id"), Some(&Value::Integer(7)));
    }
}
