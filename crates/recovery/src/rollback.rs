//! Timeout sweep and rollback replay

use crate::reverse::{Reversal, reverse};
use crate::{RecoveryError, Result};
use a2pc_backend::BackendManager;
use a2pc_common::{TransactionStatus, Xid, now_millis};
use a2pc_store::{CompensationLog, LockRecord, LockStore, TransactionStore};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackConfig {
    pub interval: Duration,
    /// ACTIVE transactions untouched for longer are rolled back
    pub active_timeout: Duration,
    pub batch_size: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            active_timeout: Duration::from_secs(600),
            batch_size: 100,
        }
    }
}

/// Result of replaying one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Every logged row reversed, status now ROLLBACKED
    RolledBack { rows: usize },
    /// Status was no longer ROLLBACKING
    Skipped(TransactionStatus),
    NotFound,
}

/// Finishes rollbacks recorded by the coordinator
pub struct RollbackWorker {
    transactions: Arc<TransactionStore>,
    locks: Arc<LockStore>,
    backends: Arc<BackendManager>,
    config: RollbackConfig,
}

impl RollbackWorker {
    pub fn new(
        transactions: Arc<TransactionStore>,
        locks: Arc<LockStore>,
        backends: Arc<BackendManager>,
        config: RollbackConfig,
    ) -> Self {
        Self {
            transactions,
            locks,
            backends,
            config,
        }
    }

    pub fn config(&self) -> &RollbackConfig {
        &self.config
    }

    pub fn partitions(&self) -> usize {
        self.transactions.partitions()
    }

    /// Move stale ACTIVE transactions of `partition` to ROLLBACKING
    pub async fn sweep_timeouts(&self, partition: usize) -> Result<u64> {
        let cutoff = now_millis() - self.config.active_timeout.as_millis() as i64;
        let expired = self.transactions.expire_active(partition, cutoff).await?;
        if expired > 0 {
            tracing::info!(
                "Partition {}: {} idle transactions timed out",
                partition,
                expired
            );
        }
        Ok(expired)
    }

    /// Replay up to one batch of ROLLBACKING transactions, oldest first.
    ///
    /// A transaction that fails to replay stays ROLLBACKING; the others go on.
    pub async fn replay_partition(&self, partition: usize) -> Result<usize> {
        let pending = self
            .transactions
            .select_by_status(
                partition,
                &[TransactionStatus::Rollbacking],
                self.config.batch_size,
            )
            .await?;
        let mut done = 0;
        for record in pending {
            match self.replay(record.xid).await {
                Ok(ReplayOutcome::RolledBack { .. }) => done += 1,
                Ok(_) => {}
                Err(err) => log_failure(record.xid, &err),
            }
        }
        Ok(done)
    }

    /// Sweep then replay one partition
    pub async fn run_once(&self, partition: usize) -> Result<usize> {
        self.sweep_timeouts(partition).await?;
        self.replay_partition(partition).await
    }

    /// Reverse every logged change of `xid` and mark it ROLLBACKED.
    ///
    /// Holds the status row lock for the whole replay, so concurrent
    /// replays of one xid serialize and the second finds it resolved.
    pub async fn replay(&self, xid: Xid) -> Result<ReplayOutcome> {
        let Some(mut locked) = self.transactions.lock_for_update(xid).await? else {
            return Ok(ReplayOutcome::NotFound);
        };
        let status = locked.record().status;
        if status != TransactionStatus::Rollbacking {
            locked.release().await?;
            return Ok(ReplayOutcome::Skipped(status));
        }

        let rows = match self.reverse_all(xid).await {
            Ok(rows) => rows,
            Err(err) => {
                if let Err(release) = locked.release().await {
                    tracing::warn!("Releasing {} after failed replay: {}", xid, release);
                }
                return Err(err);
            }
        };
        locked.set_status(TransactionStatus::Rollbacked).await?;
        locked.commit().await?;
        tracing::info!("Rolled back {} ({} rows)", xid, rows);
        Ok(ReplayOutcome::RolledBack { rows })
    }

    async fn reverse_all(&self, xid: Xid) -> Result<usize> {
        let locks = self.locks.find_by_xid(xid).await?;
        let mut rows = 0;
        for lock in &locks {
            if self.reverse_lock(xid, lock).await? {
                rows += 1;
            }
        }
        Ok(rows)
    }

    /// Reverse the row behind one lock in a local transaction on its node
    async fn reverse_lock(&self, xid: Xid, lock: &LockRecord) -> Result<bool> {
        let mut conn = self.backends.acquire(&lock.node).await?;
        conn.begin().await?;
        let outcome: Result<Option<Reversal>> = async {
            let Some(record) =
                CompensationLog::fetch(&mut *conn, xid, &lock.table, &lock.lock_key).await?
            else {
                return Ok(None);
            };
            reverse(&mut *conn, &lock.node, &record).await.map(Some)
        }
        .await;

        match outcome {
            Ok(reversal) => {
                conn.commit().await?;
                match reversal {
                    Some(reversal) => {
                        tracing::debug!(
                            "{}: {} on {}.{} -> {:?}",
                            xid,
                            lock.lock_key,
                            lock.node,
                            lock.table,
                            reversal
                        );
                        Ok(reversal != Reversal::Unchanged)
                    }
                    None => {
                        tracing::debug!(
                            "{}: no compensation record for {} on {}.{}",
                            xid,
                            lock.lock_key,
                            lock.node,
                            lock.table
                        );
                        Ok(false)
                    }
                }
            }
            Err(err) => {
                if let Err(rollback) = conn.rollback().await {
                    tracing::warn!("Local rollback on {} failed: {}", lock.node, rollback);
                }
                Err(err)
            }
        }
    }
}

fn log_failure(xid: Xid, err: &RecoveryError) {
    if err.is_integrity_incident() {
        tracing::error!("Replay of {} stopped, left ROLLBACKING: {}", xid, err);
    } else {
        tracing::warn!("Replay of {} failed, will retry: {}", xid, err);
    }
}

pub(crate) fn report(xid: Xid, result: Result<ReplayOutcome>) {
    match result {
        Ok(outcome) => tracing::debug!("Scheduled replay of {}: {:?}", xid, outcome),
        Err(err) => log_failure(xid, &err),
    }
}
