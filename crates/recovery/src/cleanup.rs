//! Removal of finished transactions

use crate::Result;
use a2pc_common::{TransactionStatus, Xid};
use a2pc_store::{CompensationLog, LockStore, TransactionStore};
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// Nodes whose compensation logs are always swept, in addition to the
    /// nodes with an installed log table and those named by the
    /// transaction's remaining locks
    pub log_nodes: Vec<String>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            log_nodes: Vec::new(),
        }
    }
}

/// Deletes locks, compensation logs and status rows of COMMIT and
/// ROLLBACKED transactions
pub struct CleanupWorker {
    transactions: Arc<TransactionStore>,
    locks: Arc<LockStore>,
    log: Arc<CompensationLog>,
    config: CleanupConfig,
}

impl CleanupWorker {
    pub fn new(
        transactions: Arc<TransactionStore>,
        locks: Arc<LockStore>,
        log: Arc<CompensationLog>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            transactions,
            locks,
            log,
            config,
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    pub fn partitions(&self) -> usize {
        self.transactions.partitions()
    }

    /// Clean up to one batch of resolved transactions of `partition`
    pub async fn clean_partition(&self, partition: usize) -> Result<usize> {
        let resolved = self
            .transactions
            .select_by_status(
                partition,
                &[TransactionStatus::Commit, TransactionStatus::Rollbacked],
                self.config.batch_size,
            )
            .await?;
        let mut cleaned = 0;
        for record in resolved {
            match self.clean(record.xid).await {
                Ok(true) => cleaned += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!("Cleanup of {} failed: {}", record.xid, err),
            }
        }
        if cleaned > 0 {
            tracing::debug!("Partition {}: cleaned {} transactions", partition, cleaned);
        }
        Ok(cleaned)
    }

    /// Remove every trace of `xid` if it is resolved. Returns whether the
    /// status row was deleted.
    pub async fn clean(&self, xid: Xid) -> Result<bool> {
        let Some(mut locked) = self.transactions.lock_for_update(xid).await? else {
            return Ok(false);
        };
        if !locked.record().status.is_resolved() {
            locked.release().await?;
            return Ok(false);
        }

        let result = async {
            // Locks of xid may have been stolen already, so the lock rows
            // alone do not name every node holding its log
            let held = self.locks.find_by_xid(xid).await?;
            let installed = self.log.nodes();
            let nodes: BTreeSet<&str> = held
                .iter()
                .map(|lock| lock.node.as_str())
                .chain(self.config.log_nodes.iter().map(String::as_str))
                .chain(installed.iter().map(String::as_str))
                .collect();
            try_join_all(nodes.iter().map(|node| self.log.delete_by_xid(node, xid))).await?;
            self.locks.delete_by_xid(xid).await?;
            locked.delete().await?;
            Ok::<_, crate::RecoveryError>(())
        }
        .await;

        match result {
            Ok(()) => {
                locked.commit().await?;
                tracing::debug!("Cleaned up {}", xid);
                Ok(true)
            }
            Err(err) => {
                if let Err(release) = locked.release().await {
                    tracing::warn!("Releasing {} after failed cleanup: {}", xid, release);
                }
                Err(err)
            }
        }
    }
}
