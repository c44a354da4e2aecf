//! Wiring of backends, stores, coordinator and recovery workers

use crate::config::{Config, NodeKind};
use crate::Result;
use a2pc_backend::{BackendManager, MemoryShard, Pool};
use a2pc_client::{CoordinatorClient, LocalCoordinatorClient};
use a2pc_common::{IdGenerator, Xid};
use a2pc_coordinator::{Coordinator, server};
use a2pc_participant::{Database, LockRetryPolicy, Participant};
use a2pc_recovery::{CleanupWorker, RollbackWorker, Workers};
use a2pc_store::{CompensationLog, LockStore, TransactionStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// A coordinator process with its recovery workers
pub struct Service {
    config: Config,
    backends: Arc<BackendManager>,
    coordinator: Arc<Coordinator>,
    transactions: Arc<TransactionStore>,
    database: Arc<Database>,
    retry: LockRetryPolicy,
    rollback: Arc<RollbackWorker>,
    cleanup: Arc<CleanupWorker>,
    scheduled: Option<mpsc::UnboundedReceiver<Xid>>,
    workers: Option<Workers>,
}

impl Service {
    /// Open every configured node and install the coordinator tables and
    /// compensation logs
    pub async fn build(config: Config) -> Result<Self> {
        let backends = Arc::new(BackendManager::new());
        for node in &config.nodes {
            let connector = match node.kind {
                NodeKind::Memory => MemoryShard::new(
                    &node.name,
                    Duration::from_millis(node.lock_wait_timeout_ms),
                ),
            };
            backends.register(Pool::new(
                &node.name,
                connector,
                node.max_connections,
                Duration::from_millis(node.acquire_timeout_ms),
            ));
        }

        let partitions = config.coordinator.partitions.clone();
        let transactions = Arc::new(TransactionStore::new(
            backends.clone(),
            partitions.clone(),
        )?);
        let locks = Arc::new(LockStore::new(backends.clone(), partitions)?);
        transactions.install().await?;
        locks.install().await?;

        let log = Arc::new(CompensationLog::new(backends.clone()));
        for node in config.data_nodes() {
            log.install(&node).await?;
        }

        let ids = IdGenerator::new(config.id.worker_id, config.id.datacenter_id)?;
        let (scheduler, scheduled) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(Arc::new(ids), transactions.clone(), locks.clone())
            .with_rollback_scheduler(Arc::new(scheduler));

        let database = Database::from_config(&config.tables)?;
        let rollback = RollbackWorker::new(
            transactions.clone(),
            locks.clone(),
            backends.clone(),
            config.rollback.worker_config(),
        );
        let cleanup = CleanupWorker::new(
            transactions.clone(),
            locks,
            log,
            config.cleanup.worker_config(),
        );

        tracing::info!(
            "Service ready: {} nodes, {} partitions, {} tables",
            config.nodes.len(),
            config.coordinator.partitions.len(),
            config.tables.len()
        );
        Ok(Self {
            retry: config.lock_retry.policy(),
            config,
            backends,
            coordinator: Arc::new(coordinator),
            transactions,
            database: Arc::new(database),
            rollback: Arc::new(rollback),
            cleanup: Arc::new(cleanup),
            scheduled: Some(scheduled),
            workers: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backends(&self) -> &Arc<BackendManager> {
        &self.backends
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn transactions(&self) -> &Arc<TransactionStore> {
        &self.transactions
    }

    pub fn rollback_worker(&self) -> &Arc<RollbackWorker> {
        &self.rollback
    }

    pub fn cleanup_worker(&self) -> &Arc<CleanupWorker> {
        &self.cleanup
    }

    /// A participant talking to this process' coordinator directly
    pub fn participant(&self) -> Participant {
        let client: Arc<dyn CoordinatorClient> =
            Arc::new(LocalCoordinatorClient::new(self.coordinator.clone()));
        Participant::new(self.database.clone(), self.backends.clone(), client)
            .with_retry_policy(self.retry)
    }

    /// Start the rollback and cleanup loops. Calling it twice is a no-op.
    pub fn start_workers(&mut self) {
        if self.workers.is_some() {
            return;
        }
        self.workers = Some(Workers::spawn(
            self.rollback.clone(),
            self.cleanup.clone(),
            self.scheduled.take(),
        ));
    }

    pub async fn stop_workers(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }
    }

    /// Serve the coordinator on `listener` with the workers running until
    /// `shutdown` resolves
    pub async fn run(
        mut self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        self.start_workers();
        let served = server::serve(listener, self.coordinator.clone(), shutdown).await;
        self.stop_workers().await;
        tracing::info!("Service stopped");
        Ok(served?)
    }
}
