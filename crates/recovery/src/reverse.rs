//! Reversal of one logged row change

use crate::{RecoveryError, Result};
use a2pc_backend::{Connection, Predicate, Statement};
use a2pc_common::{LockKey, Operation, Row, Xid};
use a2pc_store::{CompensationRecord, ReUndoLog};

/// What reversing a record did to the row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reversal {
    Deleted,
    Reinserted,
    /// Number of columns set back
    Restored(usize),
    /// Row already in its pre-transaction state
    Unchanged,
}

struct Target<'a> {
    xid: Xid,
    node: &'a str,
    table: &'a str,
    lock_key: &'a LockKey,
}

impl Target<'_> {
    fn changed(&self, detail: impl Into<String>) -> RecoveryError {
        RecoveryError::DataChanged {
            xid: self.xid,
            node: self.node.to_string(),
            table: self.table.to_string(),
            lock_key: self.lock_key.to_string(),
            detail: detail.into(),
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> RecoveryError {
        RecoveryError::CorruptLog {
            xid: self.xid,
            node: self.node.to_string(),
            table: self.table.to_string(),
            lock_key: self.lock_key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Undo `record` on `conn`, a connection to `node` inside a local
/// transaction. Reversing an already reversed record is a no-op.
pub(crate) async fn reverse(
    conn: &mut dyn Connection,
    node: &str,
    record: &CompensationRecord,
) -> Result<Reversal> {
    let target = Target {
        xid: record.xid,
        node,
        table: &record.table,
        lock_key: &record.lock_key,
    };
    let filter = Predicate::all_eq(record.lock_key.values());
    let mut rows = conn
        .execute(&Statement::select_for_update(&record.table, filter.clone()))
        .await?
        .into_rows();
    if rows.len() > 1 {
        return Err(target.changed(format!("{} rows share the lock key", rows.len())));
    }
    let current = rows.pop();

    let ReUndoLog {
        operation,
        undo,
        redo,
    } = &record.reundo_log;
    match operation {
        Operation::Insert => match current {
            None => Ok(Reversal::Unchanged),
            Some(row) if Some(&row) == redo.as_ref() => {
                conn.execute(&Statement::delete(&record.table, filter))
                    .await?;
                Ok(Reversal::Deleted)
            }
            Some(_) => Err(target.changed("inserted row was modified")),
        },
        Operation::Delete => {
            let undo = undo
                .as_ref()
                .ok_or_else(|| target.corrupt("DELETE without before-image"))?;
            match current {
                None => {
                    conn.execute(&Statement::insert(&record.table, undo.clone()))
                        .await?;
                    Ok(Reversal::Reinserted)
                }
                Some(row) if &row == undo => Ok(Reversal::Unchanged),
                Some(_) => Err(target.changed("deleted row was recreated")),
            }
        }
        Operation::Update => {
            let undo = undo
                .as_ref()
                .ok_or_else(|| target.corrupt("UPDATE without before-image"))?;
            let Some(row) = current else {
                return Err(target.changed("updated row is gone"));
            };
            let differing = differing_columns(undo, &row);
            if differing.is_empty() {
                return Ok(Reversal::Unchanged);
            }
            let restored = differing.len();
            conn.execute(&Statement::update(&record.table, differing, filter))
                .await?;
            Ok(Reversal::Restored(restored))
        }
    }
}

/// Columns of `undo` whose value differs in `current`
fn differing_columns(undo: &Row, current: &Row) -> Row {
    undo.iter()
        .filter(|(column, value)| current.get(*column) != Some(*value))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}
