//! Core coordinator implementation

use crate::error::{CoordinatorError, Result};
use crate::protocol::{Request, Response};
use a2pc_common::{IdGenerator, LockKey, TransactionStatus, Xid};
use a2pc_store::{LockStore, TransactionRecord, TransactionStore, Transition};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Hand-off of freshly rolled back transactions to the replay worker
pub trait RollbackScheduler: Send + Sync {
    fn schedule(&self, xid: Xid);
}

impl RollbackScheduler for mpsc::UnboundedSender<Xid> {
    fn schedule(&self, xid: Xid) {
        if self.send(xid).is_err() {
            tracing::debug!("Rollback worker gone, {} left to the periodic sweep", xid);
        }
    }
}

/// Result of a lock acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// Held by a transaction that is still ACTIVE or ROLLBACKING
    Busy,
}

/// Stateless transaction manager.
///
/// All state lives in the transaction and lock stores, so any number of
/// coordinators may serve the same partitions.
pub struct Coordinator {
    ids: Arc<IdGenerator>,
    transactions: Arc<TransactionStore>,
    locks: Arc<LockStore>,
    scheduler: Option<Arc<dyn RollbackScheduler>>,
}

impl Coordinator {
    pub fn new(
        ids: Arc<IdGenerator>,
        transactions: Arc<TransactionStore>,
        locks: Arc<LockStore>,
    ) -> Self {
        Self {
            ids,
            transactions,
            locks,
            scheduler: None,
        }
    }

    /// Notify `scheduler` of every transaction moved to ROLLBACKING
    pub fn with_rollback_scheduler(mut self, scheduler: Arc<dyn RollbackScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Start a transaction
    pub async fn begin(&self, client_id: &str) -> Result<Xid> {
        let xid = self.ids.next_id().await;
        self.transactions
            .insert(&TransactionRecord::new(xid, client_id))
            .await?;
        tracing::debug!("Began transaction {} for client {:?}", xid, client_id);
        Ok(xid)
    }

    /// Mark `xid` committed. Committing twice is a no-op.
    pub async fn commit(&self, xid: Xid) -> Result<()> {
        let allowed = [TransactionStatus::Active, TransactionStatus::Commit];
        match self
            .transactions
            .transition(xid, &allowed, TransactionStatus::Commit)
            .await?
        {
            Transition::Applied { .. } => {
                tracing::debug!("Committed transaction {}", xid);
                Ok(())
            }
            Transition::Rejected { current } => Err(CoordinatorError::InvalidState {
                xid,
                status: current,
            }),
            Transition::NotFound => Err(CoordinatorError::TransactionNotFound(xid)),
        }
    }

    /// Mark `xid` for rollback and hand it to the replay worker.
    ///
    /// Rolling back an already rolled back transaction succeeds.
    pub async fn rollback(&self, xid: Xid) -> Result<()> {
        let allowed = [TransactionStatus::Active, TransactionStatus::Rollbacking];
        match self
            .transactions
            .transition(xid, &allowed, TransactionStatus::Rollbacking)
            .await?
        {
            Transition::Applied { .. } => {
                tracing::debug!("Rolling back transaction {}", xid);
                if let Some(scheduler) = &self.scheduler {
                    scheduler.schedule(xid);
                }
                Ok(())
            }
            Transition::Rejected {
                current: TransactionStatus::Rollbacked,
            } => Ok(()),
            Transition::Rejected { current } => Err(CoordinatorError::InvalidState {
                xid,
                status: current,
            }),
            Transition::NotFound => Err(CoordinatorError::TransactionNotFound(xid)),
        }
    }

    /// Try to take the global lock on `(lock_key, node, table)` for `xid`.
    ///
    /// Re-entrant for the current owner. A lock whose owner has resolved is
    /// stolen. A lock held by a live owner, or by an xid without a status
    /// row, reports `Busy` and the caller retries.
    pub async fn acquire_lock(
        &self,
        xid: Xid,
        node: &str,
        table: &str,
        lock_key: &LockKey,
    ) -> Result<LockOutcome> {
        let claim = match self.locks.claim(xid, node, table, lock_key).await {
            Ok(claim) => claim,
            Err(err) => {
                let err = CoordinatorError::from(err);
                if let CoordinatorError::LockConflict(detail) = &err {
                    tracing::error!("Lock table integrity incident: {}", detail);
                }
                return Err(err);
            }
        };

        let holder = claim.holder();
        if holder == xid {
            claim.grant().await?;
            return Ok(LockOutcome::Granted);
        }

        let holder_status = match self.transactions.get(holder).await {
            Ok(record) => record.map(|r| r.status),
            Err(err) => {
                claim.abort().await?;
                return Err(err.into());
            }
        };

        // A holder without a status row counts as ACTIVE
        let status = holder_status.unwrap_or_else(|| {
            tracing::debug!("Lock holder {} has no transaction record", holder);
            TransactionStatus::Active
        });
        if status.is_live() {
            claim.abort().await?;
            tracing::debug!(
                "Lock {} on {}.{} busy: held by {} ({}), wanted by {}",
                lock_key,
                node,
                table,
                holder,
                status,
                xid
            );
            return Ok(LockOutcome::Busy);
        }

        claim.steal(xid).await?;
        tracing::info!(
            "Lock {} on {}.{} stolen by {} from {} ({})",
            lock_key,
            node,
            table,
            xid,
            holder,
            status
        );
        Ok(LockOutcome::Granted)
    }

    /// Serve one wire request
    pub async fn handle(&self, request: Request) -> Response {
        tracing::debug!("{} request for {:?}", request.action(), request.xid());
        let xid = request.xid();
        let result = match request {
            Request::Begin { client_id } => self.begin(&client_id).await.map(Response::ok),
            Request::Commit { xid } => self.commit(xid).await.map(|_| Response::ok(xid)),
            Request::Rollback { xid } => self.rollback(xid).await.map(|_| Response::ok(xid)),
            Request::AcquireLock {
                xid,
                node,
                table,
                lock_key,
                context: _,
            } => self
                .acquire_lock(xid, &node, &table, &lock_key)
                .await
                .map(|outcome| match outcome {
                    LockOutcome::Granted => Response::ok(xid),
                    LockOutcome::Busy => Response::busy(xid),
                }),
        };

        result.unwrap_or_else(|err| {
            if matches!(err, CoordinatorError::Store(_)) {
                tracing::warn!("Request for {:?} failed: {}", xid, err);
            }
            Response::error(err.code(), xid, err.to_string())
        })
    }
}
