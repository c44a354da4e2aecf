//! In-memory shard backend
//!
//! `MemoryShard` behaves like a single MySQL instance closely enough to drive
//! the transaction layer in tests and single-process deployments:
//!
//! - Tables are created on first write; `CREATE TABLE` may declare one unique key
//! - Writes and locking reads take exclusive row locks held until commit or
//!   rollback. A conflicting statement waits for the holder, up to the
//!   lock-wait timeout (error 1205)
//! - Duplicate unique keys fail with error 1062, or are skipped by `INSERT IGNORE`
//! - Uncommitted changes are undone on rollback and when a connection is dropped
//! - Plain reads do not lock and observe uncommitted data

use crate::{
    BackendError, Connection, Connector, ER_DUP_ENTRY, ER_LOCK_WAIT_TIMEOUT, Predicate,
    QueryResult, Result, Statement,
};
use a2pc_common::{Row, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

type RowId = u64;
type ConnectionId = u64;

#[derive(Debug, Default)]
struct MemTable {
    rows: BTreeMap<RowId, Row>,
    next_row_id: RowId,
    unique_key: Vec<String>,
    locks: HashMap<RowId, ConnectionId>,
}

impl MemTable {
    fn locked_by_other(&self, row_id: RowId, conn: ConnectionId) -> bool {
        self.locks.get(&row_id).is_some_and(|holder| *holder != conn)
    }

    fn unique_values(&self, row: &Row) -> Option<Vec<Value>> {
        if self.unique_key.is_empty() {
            return None;
        }
        let mut values = Vec::with_capacity(self.unique_key.len());
        for column in &self.unique_key {
            match row.get(column) {
                Some(value) if !value.is_null() => values.push(value.clone()),
                _ => return None,
            }
        }
        Some(values)
    }

    /// Row other than `except` holding the same unique key as `row`
    fn duplicate_of(&self, row: &Row, except: Option<RowId>) -> Option<RowId> {
        let key = self.unique_values(row)?;
        self.rows
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .find(|(_, existing)| self.unique_values(existing).as_ref() == Some(&key))
            .map(|(id, _)| *id)
    }

    fn matching(&self, filter: &[Predicate]) -> Vec<RowId> {
        self.rows
            .iter()
            .filter(|(_, row)| filter.iter().all(|p| p.matches(row)))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Debug, Default)]
struct ShardState {
    tables: HashMap<String, MemTable>,
}

#[derive(Debug)]
struct UndoEntry {
    table: String,
    row_id: RowId,
    /// `None` when the row did not exist before
    before: Option<Row>,
}

enum Attempt {
    Done(QueryResult),
    Blocked,
    Failed(BackendError),
}

#[derive(Debug)]
struct ShardCore {
    name: String,
    state: Mutex<ShardState>,
    released: Notify,
    lock_wait_timeout: Duration,
    next_connection: AtomicU64,
}

/// In-memory shard, shareable by handle
#[derive(Debug, Clone)]
pub struct MemoryShard {
    core: Arc<ShardCore>,
}

impl MemoryShard {
    pub fn new(name: impl Into<String>, lock_wait_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(ShardCore {
                name: name.into(),
                state: Mutex::new(ShardState::default()),
                released: Notify::new(),
                lock_wait_timeout,
                next_connection: AtomicU64::new(1),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Open a connection directly, bypassing any pool
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            id: self.core.next_connection.fetch_add(1, AtomicOrdering::Relaxed),
            core: self.core.clone(),
            in_transaction: false,
            undo: Vec::new(),
        }
    }

    /// Current contents of `table` in insertion order, including uncommitted rows
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.core.state.lock();
        state
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        let state = self.core.state.lock();
        let mut names: Vec<String> = state.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of rows currently locked in `table`
    pub fn locked_rows(&self, table: &str) -> usize {
        let state = self.core.state.lock();
        state.tables.get(table).map(|t| t.locks.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MemoryShard {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.connection()))
    }
}

/// A session against a `MemoryShard`
pub struct MemoryConnection {
    id: ConnectionId,
    core: Arc<ShardCore>,
    in_transaction: bool,
    undo: Vec<UndoEntry>,
}

impl MemoryConnection {
    fn try_execute(&mut self, statement: &Statement) -> Option<Result<QueryResult>> {
        let mut state = self.core.state.lock();
        let mark = self.undo.len();

        let outcome = apply(&mut state, self.id, statement, &mut self.undo);
        let result = match outcome {
            Attempt::Blocked => {
                undo_to(&mut state, &mut self.undo, mark);
                if !self.in_transaction {
                    release_locks(&mut state, self.id);
                }
                return None;
            }
            Attempt::Failed(err) => {
                undo_to(&mut state, &mut self.undo, mark);
                Err(err)
            }
            Attempt::Done(result) => Ok(result),
        };

        if !self.in_transaction {
            self.undo.clear();
            release_locks(&mut state, self.id);
            drop(state);
            self.core.released.notify_waiters();
        }
        Some(result)
    }

    fn finish(&mut self, rollback: bool) {
        let mut state = self.core.state.lock();
        if rollback {
            undo_to(&mut state, &mut self.undo, 0);
        }
        self.undo.clear();
        release_locks(&mut state, self.id);
        drop(state);
        self.in_transaction = false;
        self.core.released.notify_waiters();
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(BackendError::AlreadyInTransaction);
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(BackendError::NoTransaction);
        }
        self.finish(false);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(BackendError::NoTransaction);
        }
        self.finish(true);
        Ok(())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<QueryResult> {
        let core = self.core.clone();
        let deadline = Instant::now() + core.lock_wait_timeout;
        loop {
            // Registered before the attempt so a release in between is not missed.
            let released = core.released.notified();
            if let Some(result) = self.try_execute(statement) {
                return result;
            }
            tracing::trace!("{}: waiting for row lock: {}", core.name, statement);
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(BackendError::shard(
                    ER_LOCK_WAIT_TIMEOUT,
                    "Lock wait timeout exceeded; try restarting transaction",
                ));
            }
        }
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            tracing::debug!(
                "{}: connection dropped inside a transaction, rolling back",
                self.core.name
            );
        }
        self.finish(self.in_transaction);
    }
}

fn apply(
    state: &mut ShardState,
    conn: ConnectionId,
    statement: &Statement,
    undo: &mut Vec<UndoEntry>,
) -> Attempt {
    match statement {
        Statement::CreateTable { table, unique_key } => {
            let entry = state.tables.entry(table.clone()).or_default();
            if entry.unique_key.is_empty() {
                entry.unique_key = unique_key.clone();
            }
            Attempt::Done(QueryResult::Ok { affected_rows: 0 })
        }

        Statement::Select {
            table,
            filter,
            for_update,
            order_by,
            limit,
        } => {
            let Some(mem) = state.tables.get_mut(table) else {
                return Attempt::Done(QueryResult::Rows(Vec::new()));
            };
            let mut ids = mem.matching(filter);
            if *for_update && ids.iter().any(|id| mem.locked_by_other(*id, conn)) {
                return Attempt::Blocked;
            }
            if let Some(column) = order_by {
                ids.sort_by(|a, b| {
                    let left = mem.rows[a].get(column).unwrap_or(&Value::Null);
                    let right = mem.rows[b].get(column).unwrap_or(&Value::Null);
                    left.compare(right).unwrap_or(Ordering::Equal)
                });
            }
            if let Some(limit) = limit {
                ids.truncate(*limit);
            }
            if *for_update {
                for id in &ids {
                    mem.locks.insert(*id, conn);
                }
            }
            Attempt::Done(QueryResult::Rows(
                ids.iter().map(|id| mem.rows[id].clone()).collect(),
            ))
        }

        Statement::Insert {
            table,
            values,
            ignore,
        } => {
            let mem = state.tables.entry(table.clone()).or_default();
            if let Some(existing) = mem.duplicate_of(values, None) {
                if mem.locked_by_other(existing, conn) {
                    return Attempt::Blocked;
                }
                if *ignore {
                    return Attempt::Done(QueryResult::Ok { affected_rows: 0 });
                }
                return Attempt::Failed(duplicate_entry(mem, values));
            }
            let row_id = mem.next_row_id;
            mem.next_row_id += 1;
            mem.rows.insert(row_id, values.clone());
            mem.locks.insert(row_id, conn);
            undo.push(UndoEntry {
                table: table.clone(),
                row_id,
                before: None,
            });
            Attempt::Done(QueryResult::Ok { affected_rows: 1 })
        }

        Statement::Update {
            table,
            assignments,
            filter,
        } => {
            let Some(mem) = state.tables.get_mut(table) else {
                return Attempt::Done(QueryResult::Ok { affected_rows: 0 });
            };
            let ids = mem.matching(filter);
            if ids.iter().any(|id| mem.locked_by_other(*id, conn)) {
                return Attempt::Blocked;
            }
            for id in &ids {
                let before = mem.rows[id].clone();
                let mut after = before.clone();
                for (column, value) in assignments {
                    after.insert(column.clone(), value.clone());
                }
                if let Some(other) = mem.duplicate_of(&after, Some(*id)) {
                    if mem.locked_by_other(other, conn) {
                        return Attempt::Blocked;
                    }
                    return Attempt::Failed(duplicate_entry(mem, &after));
                }
                mem.rows.insert(*id, after);
                mem.locks.insert(*id, conn);
                undo.push(UndoEntry {
                    table: table.clone(),
                    row_id: *id,
                    before: Some(before),
                });
            }
            Attempt::Done(QueryResult::Ok {
                affected_rows: ids.len() as u64,
            })
        }

        Statement::Delete {
            table,
            filter,
            limit,
        } => {
            let Some(mem) = state.tables.get_mut(table) else {
                return Attempt::Done(QueryResult::Ok { affected_rows: 0 });
            };
            let mut ids = mem.matching(filter);
            if let Some(limit) = limit {
                ids.truncate(*limit);
            }
            if ids.iter().any(|id| mem.locked_by_other(*id, conn)) {
                return Attempt::Blocked;
            }
            for id in &ids {
                if let Some(before) = mem.rows.remove(id) {
                    mem.locks.insert(*id, conn);
                    undo.push(UndoEntry {
                        table: table.clone(),
                        row_id: *id,
                        before: Some(before),
                    });
                }
            }
            Attempt::Done(QueryResult::Ok {
                affected_rows: ids.len() as u64,
            })
        }
    }
}

fn duplicate_entry(mem: &MemTable, row: &Row) -> BackendError {
    let key: Vec<String> = mem
        .unique_values(row)
        .unwrap_or_default()
        .iter()
        .map(|v| v.to_string())
        .collect();
    BackendError::shard(
        ER_DUP_ENTRY,
        format!("Duplicate entry '{}' for key 'unique'", key.join("-")),
    )
}

fn undo_to(state: &mut ShardState, undo: &mut Vec<UndoEntry>, mark: usize) {
    while undo.len() > mark {
        let Some(entry) = undo.pop() else { break };
        let Some(mem) = state.tables.get_mut(&entry.table) else {
            continue;
        };
        match entry.before {
            Some(row) => {
                mem.rows.insert(entry.row_id, row);
            }
            None => {
                mem.rows.remove(&entry.row_id);
            }
        }
    }
}

fn release_locks(state: &mut ShardState, conn: ConnectionId) {
    for mem in state.tables.values_mut() {
        mem.locks.retain(|_, holder| *holder != conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn by_id(id: i64) -> Vec<Predicate> {
        vec![Predicate::Eq("id".into(), id.into())]
    }

    fn shard() -> Arc<MemoryShard> {
        MemoryShard::new("test", Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_autocommit_crud() {
        let shard = shard();
        let mut conn = shard.connection();

        conn.execute(&Statement::insert("users", row(&[("id", 1.into()), ("name", "a".into())])))
            .await
            .unwrap();
        let updated = conn
            .execute(&Statement::update("users", row(&[("name", "b".into())]), by_id(1)))
            .await
            .unwrap();
        assert_eq!(updated.affected_rows(), 1);

        let rows = conn
            .execute(&Statement::select("users", by_id(1)))
            .await
            .unwrap()
            .into_rows();
        assert_eq!(rows, vec![row(&[("id", 1.into()), ("name", "b".into())])]);

        conn.execute(&Statement::delete("users", by_id(1))).await.unwrap();
        assert!(shard.rows("users").is_empty());
        assert_eq!(shard.locked_rows("users"), 0);
    }

    #[tokio::test]
    async fn test_rollback_restores_rows() {
        let shard = shard();
        let mut setup = shard.connection();
        setup
            .execute(&Statement::insert("t", row(&[("id", 1.into()), ("v", 10.into())])))
            .await
            .unwrap();

        let mut conn = shard.connection();
        conn.begin().await.unwrap();
        conn.execute(&Statement::update("t", row(&[("v", 11.into())]), by_id(1)))
            .await
            .unwrap();
        conn.execute(&Statement::insert("t", row(&[("id", 2.into())])))
            .await
            .unwrap();
        conn.execute(&Statement::delete("t", by_id(1))).await.unwrap();
        conn.rollback().await.unwrap();

        assert_eq!(shard.rows("t"), vec![row(&[("id", 1.into()), ("v", 10.into())])]);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let shard = shard();
        {
            let mut conn = shard.connection();
            conn.begin().await.unwrap();
            conn.execute(&Statement::insert("t", row(&[("id", 1.into())])))
                .await
                .unwrap();
        }
        assert!(shard.rows("t").is_empty());
        assert_eq!(shard.locked_rows("t"), 0);
    }

    #[tokio::test]
    async fn test_unique_key_and_insert_ignore() {
        let shard = shard();
        let mut conn = shard.connection();
        conn.execute(&Statement::create_table("t", &["k"])).await.unwrap();
        conn.execute(&Statement::insert("t", row(&[("k", "a".into()), ("v", 1.into())])))
            .await
            .unwrap();

        let err = conn
            .execute(&Statement::insert("t", row(&[("k", "a".into()), ("v", 2.into())])))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());

        let ignored = conn
            .execute(&Statement::insert_ignore("t", row(&[("k", "a".into()), ("v", 3.into())])))
            .await
            .unwrap();
        assert_eq!(ignored.affected_rows(), 0);
        assert_eq!(shard.rows("t").len(), 1);
    }

    #[tokio::test]
    async fn test_row_lock_times_out() {
        let shard = shard();
        let mut setup = shard.connection();
        setup
            .execute(&Statement::insert("t", row(&[("id", 1.into())])))
            .await
            .unwrap();

        let mut holder = shard.connection();
        holder.begin().await.unwrap();
        holder
            .execute(&Statement::select_for_update("t", by_id(1)))
            .await
            .unwrap();

        let mut waiter = shard.connection();
        waiter.begin().await.unwrap();
        let err = waiter
            .execute(&Statement::select_for_update("t", by_id(1)))
            .await
            .unwrap_err();
        assert!(err.is_lock_wait_timeout());

        // Plain reads never wait.
        let rows = waiter
            .execute(&Statement::select("t", by_id(1)))
            .await
            .unwrap()
            .into_rows();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_commit() {
        let shard = MemoryShard::new("test", Duration::from_secs(5));
        let mut setup = shard.connection();
        setup
            .execute(&Statement::insert("t", row(&[("id", 1.into()), ("v", 0.into())])))
            .await
            .unwrap();

        let mut holder = shard.connection();
        holder.begin().await.unwrap();
        holder
            .execute(&Statement::update("t", row(&[("v", 1.into())]), by_id(1)))
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let shard = shard.clone();
            async move {
                let mut conn = shard.connection();
                conn.begin().await.unwrap();
                let rows = conn
                    .execute(&Statement::select_for_update("t", by_id(1)))
                    .await
                    .unwrap()
                    .into_rows();
                conn.commit().await.unwrap();
                rows
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        holder.commit().await.unwrap();

        let rows = waiter.await.unwrap();
        assert_eq!(rows[0]["v"], Value::Integer(1));
    }

    #[tokio::test]
    async fn test_order_by_and_limit() {
        let shard = shard();
        let mut conn = shard.connection();
        for (id, t) in [(1, 30), (2, 10), (3, 20)] {
            conn.execute(&Statement::insert("t", row(&[("id", id.into()), ("t", t.into())])))
                .await
                .unwrap();
        }
        let rows = conn
            .execute(&Statement::Select {
                table: "t".into(),
                filter: vec![],
                for_update: false,
                order_by: Some("t".into()),
                limit: Some(2),
            })
            .await
            .unwrap()
            .into_rows();
        let ids: Vec<Value> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![Value::Integer(2), Value::Integer(3)]);
    }
}
