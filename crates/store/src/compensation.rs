//! Undo/redo log kept on each data node

use crate::row::{self, xid_value};
use crate::Result;
use a2pc_backend::{BackendManager, Connection, Predicate, Statement};
use a2pc_common::{LockKey, Operation, Row, TransactionStatus, Value, Xid};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Name of the log table on every data node
pub const COMPENSATION_TABLE: &str = "reundo_log";

/// Before/after images of one logical row, stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReUndoLog {
    pub operation: Operation,
    pub undo: Option<Row>,
    pub redo: Option<Row>,
}

/// One row of `reundo_log`
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationRecord {
    pub xid: Xid,
    pub lock_key: LockKey,
    /// Physical table of the logged row
    pub table: String,
    /// Statement text that produced the last write
    pub context: String,
    pub reundo_log: ReUndoLog,
    pub status: TransactionStatus,
    pub client_id: String,
}

impl CompensationRecord {
    fn to_row(&self) -> Result<Row> {
        Ok(Row::from([
            ("xid".to_string(), xid_value(self.xid)),
            (
                "lock_key".to_string(),
                Value::Text(self.lock_key.as_str().to_string()),
            ),
            ("table".to_string(), Value::Text(self.table.clone())),
            ("context".to_string(), Value::Text(self.context.clone())),
            (
                "reundo_log".to_string(),
                Value::Text(serde_json::to_string(&self.reundo_log)?),
            ),
            ("status".to_string(), Value::Integer(self.status.code())),
            ("client_id".to_string(), Value::Text(self.client_id.clone())),
        ]))
    }

    fn from_row(row: &Row) -> Result<Self> {
        let table = COMPENSATION_TABLE;
        let lock_key = LockKey::parse(row::text(row, table, "lock_key")?)
            .map_err(|e| row::corrupt(table, e.to_string()))?;
        Ok(Self {
            xid: row::xid(row, table)?,
            lock_key,
            table: row::text(row, table, "table")?.to_string(),
            context: row::text(row, table, "context").unwrap_or_default().to_string(),
            reundo_log: serde_json::from_str(row::text(row, table, "reundo_log")?)?,
            status: row::status(row, table)?,
            client_id: row::text(row, table, "client_id").unwrap_or_default().to_string(),
        })
    }
}

fn identity(xid: Xid, table: &str, lock_key: &LockKey) -> Vec<Predicate> {
    vec![
        Predicate::Eq("xid".into(), xid_value(xid)),
        Predicate::Eq("table".into(), Value::Text(table.to_string())),
        Predicate::Eq(
            "lock_key".into(),
            Value::Text(lock_key.as_str().to_string()),
        ),
    ]
}

/// Access to the `reundo_log` tables of the data nodes
pub struct CompensationLog {
    backends: Arc<BackendManager>,
    /// Nodes whose log table was installed through this handle
    installed: Mutex<BTreeSet<String>>,
}

impl CompensationLog {
    pub fn new(backends: Arc<BackendManager>) -> Self {
        Self {
            backends,
            installed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Every node carrying a log table, in name order
    pub fn nodes(&self) -> Vec<String> {
        self.installed.lock().iter().cloned().collect()
    }

    /// Create the log table on `node` if missing
    pub async fn install(&self, node: &str) -> Result<()> {
        let mut conn = self.backends.acquire(node).await?;
        conn.execute(&Statement::create_table(
            COMPENSATION_TABLE,
            &["xid", "table", "lock_key"],
        ))
        .await?;
        self.installed.lock().insert(node.to_string());
        Ok(())
    }

    /// Insert or replace the record for `(xid, table, lock_key)` on `conn`.
    ///
    /// Runs on the caller's connection so it commits or rolls back together
    /// with the logged write.
    pub async fn upsert(conn: &mut dyn Connection, record: &CompensationRecord) -> Result<()> {
        let row = record.to_row()?;
        let updated = conn
            .execute(&Statement::update(
                COMPENSATION_TABLE,
                row.clone(),
                identity(record.xid, &record.table, &record.lock_key),
            ))
            .await?;
        if updated.affected_rows() == 0 {
            conn.execute(&Statement::insert(COMPENSATION_TABLE, row))
                .await?;
        }
        Ok(())
    }

    /// Remove the record for `(xid, table, lock_key)` on `conn`
    pub async fn remove(
        conn: &mut dyn Connection,
        xid: Xid,
        table: &str,
        lock_key: &LockKey,
    ) -> Result<()> {
        conn.execute(&Statement::delete(
            COMPENSATION_TABLE,
            identity(xid, table, lock_key),
        ))
        .await?;
        Ok(())
    }

    /// Read the record for `(xid, table, lock_key)` on `conn`
    pub async fn fetch(
        conn: &mut dyn Connection,
        xid: Xid,
        table: &str,
        lock_key: &LockKey,
    ) -> Result<Option<CompensationRecord>> {
        let rows = conn
            .execute(&Statement::select(
                COMPENSATION_TABLE,
                identity(xid, table, lock_key),
            ))
            .await?
            .into_rows();
        rows.first().map(CompensationRecord::from_row).transpose()
    }

    /// Read the record for `(xid, table, lock_key)` stored on `node`
    pub async fn get(
        &self,
        node: &str,
        xid: Xid,
        table: &str,
        lock_key: &LockKey,
    ) -> Result<Option<CompensationRecord>> {
        let mut conn = self.backends.acquire(node).await?;
        Self::fetch(&mut *conn, xid, table, lock_key).await
    }

    /// Every record of `xid` stored on `node`
    pub async fn list_by_xid(&self, node: &str, xid: Xid) -> Result<Vec<CompensationRecord>> {
        let mut conn = self.backends.acquire(node).await?;
        let rows = conn
            .execute(&Statement::select(
                COMPENSATION_TABLE,
                vec![Predicate::Eq("xid".into(), xid_value(xid))],
            ))
            .await?
            .into_rows();
        rows.iter().map(CompensationRecord::from_row).collect()
    }

    /// Delete every record of `xid` stored on `node`
    pub async fn delete_by_xid(&self, node: &str, xid: Xid) -> Result<u64> {
        let mut conn = self.backends.acquire(node).await?;
        let result = conn
            .execute(&Statement::delete(
                COMPENSATION_TABLE,
                vec![Predicate::Eq("xid".into(), xid_value(xid))],
            ))
            .await?;
        let deleted = result.affected_rows();
        if deleted > 0 {
            tracing::trace!("Deleted {} compensation records of {} on {}", deleted, xid, node);
        }
        Ok(deleted)
    }
}
