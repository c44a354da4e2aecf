//! Column accessors for stored rows

use crate::{Result, StoreError};
use a2pc_common::{Row, TransactionStatus, Value, Xid};

pub(crate) fn corrupt(table: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table: table.to_string(),
        reason: reason.into(),
    }
}

pub(crate) fn int(row: &Row, table: &str, column: &str) -> Result<i64> {
    row.get(column)
        .and_then(Value::as_i64)
        .ok_or_else(|| corrupt(table, format!("missing integer column {}", column)))
}

pub(crate) fn text<'a>(row: &'a Row, table: &str, column: &str) -> Result<&'a str> {
    row.get(column)
        .and_then(Value::as_str)
        .ok_or_else(|| corrupt(table, format!("missing text column {}", column)))
}

pub(crate) fn xid(row: &Row, table: &str) -> Result<Xid> {
    Ok(Xid::new(int(row, table, "xid")? as u64))
}

pub(crate) fn status(row: &Row, table: &str) -> Result<TransactionStatus> {
    TransactionStatus::try_from(int(row, table, "status")?)
        .map_err(|e| corrupt(table, e.to_string()))
}

pub(crate) fn xid_value(xid: Xid) -> Value {
    Value::Integer(xid.as_u64() as i64)
}
