//! Per-session transaction context

use crate::retry::{LockRequest, LockRetryPolicy};
use crate::table::{Database, ShardRef, Table};
use crate::{ParticipantError, Result};
use a2pc_backend::{
    BackendManager, Connection, PooledConnection, Predicate, QueryResult, Statement,
};
use a2pc_client::CoordinatorClient;
use a2pc_common::{LockKey, Operation, Row, TransactionStatus, Value, Xid};
use a2pc_store::{CompensationLog, CompensationRecord, ReUndoLog};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Hidden column stamped with the writing xid on every INSERT and UPDATE
///
/// Tables are expected to carry it. Rolling back an UPDATE restores the
/// before-image columns only, so a row stored without it keeps the stamp.
pub const VERSION_COLUMN: &str = "_a2pc_version";

/// Lifecycle of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Init,
    Beginning,
    Active,
    Commiting,
    Rollbacking,
    End,
}

/// Row images known for one physical row
#[derive(Debug, Clone)]
struct Images {
    /// Before the transaction first touched the row; never replaced
    undo: Option<Row>,
    /// Last state seen or written by this transaction
    current: Option<Row>,
}

/// What one target of a write produced, still uncommitted
struct TargetWrite {
    target: ShardRef,
    conn: PooledConnection,
    result: QueryResult,
    images: Images,
}

/// Shared inputs of every target of one write
struct WriteContext<'a> {
    xid: Xid,
    client_id: &'a str,
    statement: &'a Statement,
    lock_key: &'a LockKey,
}

/// Transaction context bound to one session.
///
/// Statements run one at a time through `&mut self`, so the context never
/// issues two statements against the same connection concurrently.
pub struct Participant {
    database: Arc<Database>,
    backends: Arc<BackendManager>,
    coordinator: Arc<dyn CoordinatorClient>,
    retry: LockRetryPolicy,
    deadline: Option<Instant>,
    client_id: String,
    state: ParticipantState,
    xid: Option<Xid>,
    images: HashMap<(ShardRef, String), Images>,
}

impl Participant {
    pub fn new(
        database: Arc<Database>,
        backends: Arc<BackendManager>,
        coordinator: Arc<dyn CoordinatorClient>,
    ) -> Self {
        Self {
            database,
            backends,
            coordinator,
            retry: LockRetryPolicy::default(),
            deadline: None,
            client_id: uuid::Uuid::now_v7().to_string(),
            state: ParticipantState::Init,
            xid: None,
            images: HashMap::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: LockRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Abandon lock waits that would run past `deadline`
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub fn xid(&self) -> Option<Xid> {
        self.xid
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn expect_state(&self, expected: ParticipantState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(ParticipantError::InvalidState {
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    fn active_xid(&self, operation: &'static str) -> Result<Xid> {
        self.expect_state(ParticipantState::Active, operation)?;
        self.xid.ok_or(ParticipantError::InvalidState {
            state: self.state,
            operation,
        })
    }

    /// Obtain an xid from the coordinator
    pub async fn begin(&mut self) -> Result<Xid> {
        self.expect_state(ParticipantState::Init, "begin")?;
        self.state = ParticipantState::Beginning;
        match self.coordinator.begin(&self.client_id).await {
            Ok(xid) => {
                tracing::debug!("Participant {} began {}", self.client_id, xid);
                self.xid = Some(xid);
                self.state = ParticipantState::Active;
                Ok(xid)
            }
            Err(err) => {
                self.state = ParticipantState::Init;
                Err(err.into())
            }
        }
    }

    /// Ask the coordinator to commit. On failure the transaction stays
    /// active so the caller may retry or roll back.
    pub async fn commit(&mut self) -> Result<()> {
        let xid = self.active_xid("commit")?;
        self.state = ParticipantState::Commiting;
        match self.coordinator.commit(xid).await {
            Ok(()) => {
                self.state = ParticipantState::End;
                self.images.clear();
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Commit of {} failed: {}", xid, err);
                self.state = ParticipantState::Active;
                Err(err.into())
            }
        }
    }

    /// Ask the coordinator to roll back; the rows are restored by replay
    pub async fn rollback(&mut self) -> Result<()> {
        let xid = self.active_xid("rollback")?;
        self.state = ParticipantState::Rollbacking;
        match self.coordinator.rollback(xid).await {
            Ok(()) => {
                self.state = ParticipantState::End;
                self.images.clear();
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Rollback of {} failed: {}", xid, err);
                self.state = ParticipantState::Active;
                Err(err.into())
            }
        }
    }

    /// Run one statement inside the transaction
    pub async fn execute(&mut self, statement: &Statement) -> Result<QueryResult> {
        let xid = self.active_xid("execute")?;
        let table = self.database.get_table(statement.table())?;
        match statement {
            Statement::Select {
                for_update: false, ..
            } => self.read(table.as_ref(), statement).await,
            Statement::Select { .. } => self.locking_read(xid, table.as_ref(), statement).await,
            Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. } => {
                self.write(xid, table.as_ref(), statement).await
            }
            Statement::CreateTable { .. } => {
                Err(ParticipantError::UnsupportedStatement(statement.to_string()))
            }
        }
    }

    async fn read(&self, table: &dyn Table, statement: &Statement) -> Result<QueryResult> {
        let target = primary(table, statement)?;
        let mut conn = self.backends.acquire(&target.node).await?;
        Ok(conn.execute(&statement.with_table(&target.table)).await?)
    }

    async fn acquire(
        &self,
        xid: Xid,
        target: &ShardRef,
        lock_key: &LockKey,
        statement: &Statement,
    ) -> Result<()> {
        let context = statement.to_string();
        self.retry
            .acquire(
                self.coordinator.as_ref(),
                LockRequest {
                    xid,
                    node: &target.node,
                    table: &target.table,
                    lock_key,
                    context: &context,
                },
                self.deadline,
            )
            .await
    }

    /// `SELECT ... FOR UPDATE`: take the global lock, then remember the
    /// row image so a later write logs the right before-image.
    async fn locking_read(
        &mut self,
        xid: Xid,
        table: &dyn Table,
        statement: &Statement,
    ) -> Result<QueryResult> {
        let lock_key = table.lock_key(statement)?;
        let target = primary(table, statement)?;
        self.acquire(xid, &target, &lock_key, statement).await?;

        let mut conn = self.backends.acquire(&target.node).await?;
        let rows = conn
            .execute(&Statement::select_for_update(
                &target.table,
                Predicate::all_eq(lock_key.values()),
            ))
            .await?
            .into_rows();
        let image = single_row(&target, &lock_key, rows)?;

        let entry = (target.clone(), lock_key.as_str().to_string());
        match self.images.get(&entry) {
            Some(known) if known.current != image => {
                tracing::error!(
                    "{}: row {} of {} differs from its captured image",
                    xid,
                    lock_key,
                    target.table
                );
                return Err(ParticipantError::ImageMismatch {
                    table: target.table.clone(),
                    lock_key: lock_key.to_string(),
                });
            }
            Some(_) => {}
            None => {
                self.images.insert(
                    entry,
                    Images {
                        undo: image.clone(),
                        current: image.clone(),
                    },
                );
            }
        }

        let rows = image
            .into_iter()
            .filter(|row| statement.matches(row))
            .collect();
        Ok(QueryResult::Rows(rows))
    }

    /// INSERT, UPDATE or DELETE on every target of the row
    async fn write(
        &mut self,
        xid: Xid,
        table: &dyn Table,
        statement: &Statement,
    ) -> Result<QueryResult> {
        if let Statement::Update { assignments, .. } = statement
            && let Some(column) = table
                .lock_columns()
                .iter()
                .find(|c| assignments.contains_key(*c))
        {
            return Err(ParticipantError::LockColumnAssigned {
                table: table.name().to_string(),
                column: column.clone(),
            });
        }

        let lock_key = table.lock_key(statement)?;
        let targets = table.get_node(statement)?;
        for target in &targets {
            self.acquire(xid, target, &lock_key, statement).await?;
        }

        let context = WriteContext {
            xid,
            client_id: &self.client_id,
            statement,
            lock_key: &lock_key,
        };
        let outcomes = join_all(targets.iter().map(|target| {
            let known = self
                .images
                .get(&(target.clone(), lock_key.as_str().to_string()))
                .map(|images| images.undo.clone());
            write_target(&self.backends, &context, target.clone(), known)
        }))
        .await;

        let mut writes = Vec::with_capacity(outcomes.len());
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(write) => writes.push(write),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = failure {
            tracing::debug!("{}: write failed, rolling back {} targets", xid, writes.len());
            for mut write in writes {
                if let Err(rollback) = write.conn.rollback().await {
                    tracing::warn!("{}: local rollback on {} failed: {}", xid, write.target.node, rollback);
                }
            }
            return Err(err);
        }

        let mut committed = Vec::with_capacity(writes.len());
        let mut writes = writes.into_iter();
        while let Some(mut write) = writes.next() {
            if let Err(err) = write.conn.commit().await {
                tracing::error!(
                    "{}: commit on {} failed after {} targets committed: {}",
                    xid,
                    write.target.node,
                    committed.len(),
                    err
                );
                for mut rest in writes {
                    if let Err(rollback) = rest.conn.rollback().await {
                        tracing::warn!("{}: local rollback on {} failed: {}", xid, rest.target.node, rollback);
                    }
                }
                self.remember(&lock_key, committed);
                return Err(err.into());
            }
            committed.push(write);
        }

        let result = committed
            .first()
            .map(|write| write.result.clone())
            .unwrap_or(QueryResult::Ok { affected_rows: 0 });
        self.remember(&lock_key, committed);
        Ok(result)
    }

    fn remember(&mut self, lock_key: &LockKey, writes: Vec<TargetWrite>) {
        for write in writes {
            let entry = (write.target, lock_key.as_str().to_string());
            if write.images.undo.is_none() && write.images.current.is_none() {
                self.images.remove(&entry);
            } else {
                self.images.insert(entry, write.images);
            }
        }
    }
}

fn primary(table: &dyn Table, statement: &Statement) -> Result<ShardRef> {
    table
        .get_node(statement)?
        .into_iter()
        .next()
        .ok_or_else(|| ParticipantError::InvalidTable {
            table: table.name().to_string(),
            reason: "no backend".to_string(),
        })
}

fn single_row(target: &ShardRef, lock_key: &LockKey, mut rows: Vec<Row>) -> Result<Option<Row>> {
    if rows.len() > 1 {
        return Err(ParticipantError::NotUnique {
            table: target.table.clone(),
            lock_key: lock_key.to_string(),
            rows: rows.len(),
        });
    }
    Ok(rows.pop())
}

/// Statement as sent to one physical table, stamped with the version column
fn physical(statement: &Statement, table: &str, xid: Xid) -> Statement {
    let version = Value::from(xid.as_u64());
    match statement.with_table(table) {
        Statement::Insert {
            table,
            mut values,
            ignore,
        } => {
            values.insert(VERSION_COLUMN.to_string(), version);
            Statement::Insert {
                table,
                values,
                ignore,
            }
        }
        Statement::Update {
            table,
            mut assignments,
            filter,
        } => {
            assignments.insert(VERSION_COLUMN.to_string(), version);
            Statement::Update {
                table,
                assignments,
                filter,
            }
        }
        other => other,
    }
}

/// Effective operation of a row relative to its pre-transaction image
fn effective_operation(undo: &Option<Row>, redo: &Option<Row>) -> Option<Operation> {
    match (undo, redo) {
        (None, Some(_)) => Some(Operation::Insert),
        (Some(_), None) => Some(Operation::Delete),
        (Some(_), Some(_)) => Some(Operation::Update),
        (None, None) => None,
    }
}

/// Run the write on one target inside a local transaction that also logs
/// the compensation record. The transaction is left open on success.
async fn write_target(
    backends: &BackendManager,
    context: &WriteContext<'_>,
    target: ShardRef,
    known_undo: Option<Option<Row>>,
) -> Result<TargetWrite> {
    let mut conn = backends.acquire(&target.node).await?;
    conn.begin().await?;
    match stage(&mut *conn, context, &target, known_undo).await {
        Ok((result, images)) => Ok(TargetWrite {
            target,
            conn,
            result,
            images,
        }),
        Err(err) => {
            if let Err(rollback) = conn.rollback().await {
                tracing::warn!("Local rollback on {} failed: {}", target.node, rollback);
            }
            Err(err)
        }
    }
}

async fn stage(
    conn: &mut dyn Connection,
    context: &WriteContext<'_>,
    target: &ShardRef,
    known_undo: Option<Option<Row>>,
) -> Result<(QueryResult, Images)> {
    let filter = Predicate::all_eq(context.lock_key.values());
    let before = conn
        .execute(&Statement::select_for_update(&target.table, filter.clone()))
        .await?
        .into_rows();
    let before = single_row(target, context.lock_key, before)?;

    let result = conn
        .execute(&physical(context.statement, &target.table, context.xid))
        .await?;

    let after = conn
        .execute(&Statement::select(&target.table, filter))
        .await?
        .into_rows();
    let after = single_row(target, context.lock_key, after)?;

    let undo = known_undo.unwrap_or(before);
    match effective_operation(&undo, &after) {
        Some(operation) => {
            let record = CompensationRecord {
                xid: context.xid,
                lock_key: context.lock_key.clone(),
                table: target.table.clone(),
                context: context.statement.to_string(),
                reundo_log: ReUndoLog {
                    operation,
                    undo: undo.clone(),
                    redo: after.clone(),
                },
                status: TransactionStatus::Active,
                client_id: context.client_id.to_string(),
            };
            CompensationLog::upsert(conn, &record).await?;
        }
        None => {
            CompensationLog::remove(conn, context.xid, &target.table, context.lock_key).await?;
        }
    }

    tracing::trace!(
        "{}: {} on {}.{}",
        context.xid,
        context.statement,
        target.node,
        target.table
    );
    Ok((
        result,
        Images {
            undo,
            current: after,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64) -> Row {
        Row::from([("id".to_string(), Value::Integer(id))])
    }

    #[test]
    fn test_effective_operation() {
        assert_eq!(effective_operation(&None, &Some(row(1))), Some(Operation::Insert));
        assert_eq!(effective_operation(&Some(row(1)), &None), Some(Operation::Delete));
        assert_eq!(
            effective_operation(&Some(row(1)), &Some(row(1))),
            Some(Operation::Update)
        );
        assert_eq!(effective_operation(&None, &None), None);
    }

    #[test]
    fn test_physical_statement_carries_version() {
        let update = Statement::update(
            "users",
            Row::from([("name".to_string(), Value::Text("b".into()))]),
            vec![Predicate::Eq("id".into(), Value::Integer(7))],
        );
        let Statement::Update {
            table, assignments, ..
        } = physical(&update, "users_1", Xid::new(2001))
        else {
            panic!("expected UPDATE");
        };
        assert_eq!(table, "users_1");
        assert_eq!(assignments[VERSION_COLUMN], Value::Integer(2001));

        let delete = Statement::delete("users", vec![Predicate::Eq("id".into(), Value::Integer(7))]);
        assert_eq!(
            physical(&delete, "users_1", Xid::new(2001)),
            delete.with_table("users_1")
        );
    }
}
