//! Partitioned transaction status table

use crate::row::{self, xid_value};
use crate::{Result, StoreError};
use a2pc_backend::{BackendManager, PooledConnection, Predicate, Statement};
use a2pc_common::{Row, TransactionStatus, Value, Xid, now_millis};
use std::sync::Arc;

/// One row of `transaction_info_{n}`
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub xid: Xid,
    pub status: TransactionStatus,
    pub client_id: String,
    /// Milliseconds since the Unix epoch of the last status change
    pub update_time: i64,
}

impl TransactionRecord {
    pub fn new(xid: Xid, client_id: impl Into<String>) -> Self {
        Self {
            xid,
            status: TransactionStatus::Active,
            client_id: client_id.into(),
            update_time: now_millis(),
        }
    }

    fn to_row(&self) -> Row {
        Row::from([
            ("xid".to_string(), xid_value(self.xid)),
            ("status".to_string(), Value::Integer(self.status.code())),
            ("client_id".to_string(), Value::Text(self.client_id.clone())),
            ("update_time".to_string(), Value::Integer(self.update_time)),
        ])
    }

    fn from_row(row: &Row, table: &str) -> Result<Self> {
        Ok(Self {
            xid: row::xid(row, table)?,
            status: row::status(row, table)?,
            client_id: row::text(row, table, "client_id").unwrap_or_default().to_string(),
            update_time: row::int(row, table, "update_time")?,
        })
    }
}

/// Outcome of a guarded status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { previous: TransactionStatus },
    Rejected { current: TransactionStatus },
    NotFound,
}

/// Transaction status rows spread over N partitions, addressed by `xid mod N`
pub struct TransactionStore {
    backends: Arc<BackendManager>,
    partitions: Vec<String>,
}

impl TransactionStore {
    /// `partitions[i]` names the node holding `transaction_info_{i}`
    pub fn new(backends: Arc<BackendManager>, partitions: Vec<String>) -> Result<Self> {
        if partitions.is_empty() {
            return Err(StoreError::NoPartitions);
        }
        Ok(Self {
            backends,
            partitions,
        })
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn table_name(partition: usize) -> String {
        format!("transaction_info_{}", partition)
    }

    fn locate(&self, xid: Xid) -> (usize, String) {
        let partition = xid.partition(self.partitions.len());
        (partition, Self::table_name(partition))
    }

    async fn connect(&self, partition: usize) -> Result<PooledConnection> {
        Ok(self.backends.acquire(&self.partitions[partition]).await?)
    }

    /// Create the partition tables if missing
    pub async fn install(&self) -> Result<()> {
        for partition in 0..self.partitions.len() {
            let mut conn = self.connect(partition).await?;
            conn.execute(&Statement::create_table(Self::table_name(partition), &["xid"]))
                .await?;
        }
        tracing::debug!("Installed {} transaction partitions", self.partitions.len());
        Ok(())
    }

    pub async fn insert(&self, record: &TransactionRecord) -> Result<()> {
        let (partition, table) = self.locate(record.xid);
        let mut conn = self.connect(partition).await?;
        conn.execute(&Statement::insert(table, record.to_row())).await?;
        Ok(())
    }

    pub async fn get(&self, xid: Xid) -> Result<Option<TransactionRecord>> {
        let (partition, table) = self.locate(xid);
        let mut conn = self.connect(partition).await?;
        let rows = conn
            .execute(&Statement::select(&table, by_xid(xid)))
            .await?
            .into_rows();
        rows.first()
            .map(|row| TransactionRecord::from_row(row, &table))
            .transpose()
    }

    /// Move `xid` to `to` if its current status is one of `allowed_from`.
    ///
    /// The check and the update run under the row lock of the status row.
    pub async fn transition(
        &self,
        xid: Xid,
        allowed_from: &[TransactionStatus],
        to: TransactionStatus,
    ) -> Result<Transition> {
        let Some(mut locked) = self.lock_for_update(xid).await? else {
            return Ok(Transition::NotFound);
        };
        let current = locked.record().status;
        if !allowed_from.contains(&current) {
            locked.release().await?;
            return Ok(Transition::Rejected { current });
        }
        if current != to {
            locked.set_status(to).await?;
        }
        locked.commit().await?;
        Ok(Transition::Applied { previous: current })
    }

    /// Oldest-first batch of transactions in any of `statuses` on one partition
    pub async fn select_by_status(
        &self,
        partition: usize,
        statuses: &[TransactionStatus],
        limit: usize,
    ) -> Result<Vec<TransactionRecord>> {
        let table = Self::table_name(partition);
        let mut conn = self.connect(partition).await?;
        let rows = conn
            .execute(&Statement::Select {
                table: table.clone(),
                filter: vec![Predicate::In(
                    "status".into(),
                    statuses.iter().map(|s| Value::Integer(s.code())).collect(),
                )],
                for_update: false,
                order_by: Some("update_time".into()),
                limit: Some(limit),
            })
            .await?
            .into_rows();
        rows.iter()
            .map(|row| TransactionRecord::from_row(row, &table))
            .collect()
    }

    /// Flip ACTIVE transactions last updated before `cutoff_ms` to ROLLBACKING
    pub async fn expire_active(&self, partition: usize, cutoff_ms: i64) -> Result<u64> {
        let table = Self::table_name(partition);
        let mut conn = self.connect(partition).await?;
        let result = conn
            .execute(&Statement::update(
                table,
                Row::from([
                    (
                        "status".to_string(),
                        Value::Integer(TransactionStatus::Rollbacking.code()),
                    ),
                    ("update_time".to_string(), Value::Integer(now_millis())),
                ]),
                vec![
                    Predicate::Eq(
                        "status".into(),
                        Value::Integer(TransactionStatus::Active.code()),
                    ),
                    Predicate::Lt("update_time".into(), Value::Integer(cutoff_ms)),
                ],
            ))
            .await?;
        Ok(result.affected_rows())
    }

    /// Lock the status row of `xid` inside a local transaction.
    ///
    /// The lock is held until the returned guard commits, releases or is dropped.
    pub async fn lock_for_update(&self, xid: Xid) -> Result<Option<LockedTransaction>> {
        let (partition, table) = self.locate(xid);
        let mut conn = self.connect(partition).await?;
        conn.begin().await?;
        let rows = conn
            .execute(&Statement::select_for_update(&table, by_xid(xid)))
            .await?
            .into_rows();
        let Some(row) = rows.first() else {
            conn.rollback().await?;
            return Ok(None);
        };
        let record = TransactionRecord::from_row(row, &table)?;
        Ok(Some(LockedTransaction {
            conn,
            table,
            record,
        }))
    }
}

fn by_xid(xid: Xid) -> Vec<Predicate> {
    vec![Predicate::Eq("xid".into(), xid_value(xid))]
}

/// A transaction status row held under `SELECT ... FOR UPDATE`
pub struct LockedTransaction {
    conn: PooledConnection,
    table: String,
    record: TransactionRecord,
}

impl LockedTransaction {
    pub fn record(&self) -> &TransactionRecord {
        &self.record
    }

    /// Update the status; takes effect on commit
    pub async fn set_status(&mut self, status: TransactionStatus) -> Result<()> {
        let update_time = now_millis();
        self.conn
            .execute(&Statement::update(
                &self.table,
                Row::from([
                    ("status".to_string(), Value::Integer(status.code())),
                    ("update_time".to_string(), Value::Integer(update_time)),
                ]),
                by_xid(self.record.xid),
            ))
            .await?;
        self.record.status = status;
        self.record.update_time = update_time;
        Ok(())
    }

    /// Delete the status row; takes effect on commit
    pub async fn delete(&mut self) -> Result<()> {
        self.conn
            .execute(&Statement::delete(&self.table, by_xid(self.record.xid)))
            .await?;
        Ok(())
    }

    pub async fn commit(mut self) -> Result<()> {
        self.conn.commit().await?;
        Ok(())
    }

    /// Roll back and release the row lock
    pub async fn release(mut self) -> Result<()> {
        self.conn.rollback().await?;
        Ok(())
    }
}
