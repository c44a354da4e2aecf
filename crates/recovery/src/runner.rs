//! Background tasks driving the workers

use crate::rollback::report;
use crate::{CleanupWorker, RollbackWorker};
use a2pc_common::Xid;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to the spawned worker tasks
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawn one rollback loop and one cleanup loop per partition, plus a
    /// consumer replaying xids handed over by the coordinator.
    pub fn spawn(
        rollback: Arc<RollbackWorker>,
        cleanup: Arc<CleanupWorker>,
        scheduled: Option<mpsc::UnboundedReceiver<Xid>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        for partition in 0..rollback.partitions() {
            let worker = rollback.clone();
            handles.push(tokio::spawn(every(
                format!("rollback-{}", partition),
                rollback.config().interval,
                shutdown.subscribe(),
                move || {
                    let worker = worker.clone();
                    async move {
                        if let Err(err) = worker.run_once(partition).await {
                            tracing::warn!("Rollback sweep of partition {} failed: {}", partition, err);
                        }
                    }
                },
            )));
        }

        for partition in 0..cleanup.partitions() {
            let worker = cleanup.clone();
            handles.push(tokio::spawn(every(
                format!("cleanup-{}", partition),
                cleanup.config().interval,
                shutdown.subscribe(),
                move || {
                    let worker = worker.clone();
                    async move {
                        if let Err(err) = worker.clean_partition(partition).await {
                            tracing::warn!("Cleanup of partition {} failed: {}", partition, err);
                        }
                    }
                },
            )));
        }

        if let Some(scheduled) = scheduled {
            handles.push(tokio::spawn(consume(
                rollback,
                scheduled,
                shutdown.subscribe(),
            )));
        }

        tracing::info!("Started {} recovery tasks", handles.len());
        Self { shutdown, handles }
    }

    /// Signal every task and wait for them to stop
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::warn!("Recovery task ended abnormally: {}", err);
            }
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `tick` every `period` until shutdown
async fn every<F, Fut>(
    name: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;

            _ = stopped(&mut shutdown) => break,
            _ = interval.tick() => tick().await,
        }
    }
    tracing::debug!("{} stopped", name);
}

/// Replay xids as soon as the coordinator marks them ROLLBACKING
async fn consume(
    worker: Arc<RollbackWorker>,
    mut scheduled: mpsc::UnboundedReceiver<Xid>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = stopped(&mut shutdown) => break,
            next = scheduled.recv() => match next {
                Some(xid) => report(xid, worker.replay(xid).await),
                None => break,
            },
        }
    }
    tracing::debug!("Scheduled rollback consumer stopped");
}
