//! Partitioned global lock table

use crate::row::{self, xid_value};
use crate::{Result, StoreError};
use a2pc_backend::{BackendManager, PooledConnection, Predicate, Statement};
use a2pc_common::{LockKey, Row, Value, Xid};
use futures::future::try_join_all;
use std::sync::Arc;

/// One row of `lock_table_{n}`
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub lock_key: LockKey,
    pub xid: Xid,
    /// Data node holding the locked row
    pub node: String,
    /// Physical table holding the locked row
    pub table: String,
}

impl LockRecord {
    fn to_row(&self) -> Row {
        Row::from([
            (
                "lock_key".to_string(),
                Value::Text(self.lock_key.as_str().to_string()),
            ),
            ("xid".to_string(), xid_value(self.xid)),
            ("node".to_string(), Value::Text(self.node.clone())),
            ("table".to_string(), Value::Text(self.table.clone())),
        ])
    }

    fn from_row(row: &Row, table: &str) -> Result<Self> {
        let lock_key = LockKey::parse(row::text(row, table, "lock_key")?)
            .map_err(|e| row::corrupt(table, e.to_string()))?;
        Ok(Self {
            lock_key,
            xid: row::xid(row, table)?,
            node: row::text(row, table, "node")?.to_string(),
            table: row::text(row, table, "table")?.to_string(),
        })
    }

    fn identity(&self) -> Vec<Predicate> {
        vec![
            Predicate::Eq(
                "lock_key".into(),
                Value::Text(self.lock_key.as_str().to_string()),
            ),
            Predicate::Eq("node".into(), Value::Text(self.node.clone())),
            Predicate::Eq("table".into(), Value::Text(self.table.clone())),
        ]
    }
}

/// Lock rows spread over N partitions, addressed by `hash(lock_key) mod N`
pub struct LockStore {
    backends: Arc<BackendManager>,
    partitions: Vec<String>,
}

impl LockStore {
    /// `partitions[i]` names the node holding `lock_table_{i}`
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
        format!("lock_table_{}", partition)
    }

    async fn connect(&self, partition: usize) -> Result<PooledConnection> {
        Ok(self.backends.acquire(&self.partitions[partition]).await?)
    }

    pub async fn install(&self) -> Result<()> {
        for partition in 0..self.partitions.len() {
            let mut conn = self.connect(partition).await?;
            conn.execute(&Statement::create_table(
                Self::table_name(partition),
                &["lock_key", "node", "table"],
            ))
            .await?;
        }
        tracing::debug!("Installed {} lock partitions", self.partitions.len());
        Ok(())
    }

    /// Claim the lock row for `(lock_key, node, table)` on behalf of `xid`.
    ///
    /// Inserts the row with `xid` as owner unless one exists, then reads it
    /// back under a row lock. The returned claim keeps that row lock until it
    /// is granted, stolen or aborted, so the caller decides on a stable owner.
    pub async fn claim(
        &self,
        xid: Xid,
        node: &str,
        table: &str,
        lock_key: &LockKey,
    ) -> Result<LockClaim> {
        let partition = lock_key.partition(self.partitions.len());
        let lock_table = Self::table_name(partition);
        let wanted = LockRecord {
            lock_key: lock_key.clone(),
            xid,
            node: node.to_string(),
            table: table.to_string(),
        };

        let mut conn = self.connect(partition).await?;
        conn.begin().await?;
        conn.execute(&Statement::insert_ignore(&lock_table, wanted.to_row()))
            .await?;
        let rows = conn
            .execute(&Statement::select_for_update(&lock_table, wanted.identity()))
            .await?
            .into_rows();

        match rows.as_slice() {
            [row] => {
                let record = LockRecord::from_row(row, &lock_table)?;
                Ok(LockClaim {
                    conn,
                    table: lock_table,
                    record,
                })
            }
            [] => {
                conn.rollback().await?;
                Err(StoreError::LockRowMissing(lock_key.to_string()))
            }
            many => {
                conn.rollback().await?;
                Err(StoreError::LockConflict {
                    lock_key: lock_key.to_string(),
                    node: node.to_string(),
                    table: table.to_string(),
                    count: many.len(),
                })
            }
        }
    }

    /// Every lock row owned by `xid`, across all partitions
    pub async fn find_by_xid(&self, xid: Xid) -> Result<Vec<LockRecord>> {
        let lookups = (0..self.partitions.len()).map(|partition| async move {
            let table = Self::table_name(partition);
            let mut conn = self.connect(partition).await?;
            let rows = conn
                .execute(&Statement::select(&table, owned_by(xid)))
                .await?
                .into_rows();
            rows.iter()
                .map(|row| LockRecord::from_row(row, &table))
                .collect::<Result<Vec<_>>>()
        });
        Ok(try_join_all(lookups).await?.into_iter().flatten().collect())
    }

    /// Delete every lock row owned by `xid`, across all partitions
    pub async fn delete_by_xid(&self, xid: Xid) -> Result<u64> {
        let deletes = (0..self.partitions.len()).map(|partition| async move {
            let mut conn = self.connect(partition).await?;
            let result = conn
                .execute(&Statement::delete(Self::table_name(partition), owned_by(xid)))
                .await?;
            Ok::<_, StoreError>(result.affected_rows())
        });
        Ok(try_join_all(deletes).await?.into_iter().sum())
    }
}

fn owned_by(xid: Xid) -> Vec<Predicate> {
    vec![Predicate::Eq("xid".into(), xid_value(xid))]
}

/// A lock row read under `SELECT ... FOR UPDATE`, pending a decision
pub struct LockClaim {
    conn: PooledConnection,
    table: String,
    record: LockRecord,
}

impl LockClaim {
    /// Current owner of the lock row
    pub fn holder(&self) -> Xid {
        self.record.xid
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Keep the current owner and commit
    pub async fn grant(mut self) -> Result<()> {
        self.conn.commit().await?;
        Ok(())
    }

    /// Reassign the row to `xid` and commit
    pub async fn steal(mut self, xid: Xid) -> Result<()> {
        self.conn
            .execute(&Statement::update(
                &self.table,
                Row::from([("xid".to_string(), xid_value(xid))]),
                self.record.identity(),
            ))
            .await?;
        self.conn.commit().await?;
        Ok(())
    }

    /// Roll back, leaving the row untouched
    pub async fn abort(mut self) -> Result<()> {
        self.conn.rollback().await?;
        Ok(())
    }
}
