//! In-process coordinator client

use crate::{ClientError, CoordinatorClient, LockOutcome, Result};
use a2pc_common::{LockKey, Xid};
use a2pc_coordinator::{Coordinator, CoordinatorError};
use async_trait::async_trait;
use std::sync::Arc;

/// Calls a `Coordinator` living in the same process
#[derive(Clone)]
pub struct LocalCoordinatorClient {
    coordinator: Arc<Coordinator>,
}

impl LocalCoordinatorClient {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

fn remote(err: CoordinatorError) -> ClientError {
    ClientError::Coordinator {
        status: err.code(),
        message: err.to_string(),
    }
}

#[async_trait]
impl CoordinatorClient for LocalCoordinatorClient {
    async fn begin(&self, client_id: &str) -> Result<Xid> {
        self.coordinator.begin(client_id).await.map_err(remote)
    }

    async fn commit(&self, xid: Xid) -> Result<()> {
        self.coordinator.commit(xid).await.map_err(remote)
    }

    async fn rollback(&self, xid: Xid) -> Result<()> {
        self.coordinator.rollback(xid).await.map_err(remote)
    }

    async fn acquire_lock(
        &self,
        xid: Xid,
        node: &str,
        table: &str,
        lock_key: &LockKey,
        _context: &str,
    ) -> Result<LockOutcome> {
        self.coordinator
            .acquire_lock(xid, node, table, lock_key)
            .await
            .map_err(remote)
    }
}
