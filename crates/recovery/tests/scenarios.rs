//! End-to-end rollback and cleanup scenarios over in-memory nodes

use a2pc_backend::{BackendManager, Connection, MemoryShard, Pool, Predicate, Statement};
use a2pc_client::LocalCoordinatorClient;
use a2pc_common::{IdGenerator, LockKey, Row, TransactionStatus, Value, Xid};
use a2pc_coordinator::{Coordinator, LockOutcome};
use a2pc_participant::{Database, Participant, RawTable, ShardRef, VERSION_COLUMN};
use a2pc_recovery::{
    CleanupConfig, CleanupWorker, RecoveryError, ReplayOutcome, RollbackConfig, RollbackWorker,
    Workers,
};
use a2pc_store::{
    CompensationLog, LockStore, TransactionRecord, TransactionStore, Transition,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const PARTITIONS: usize = 2;

struct Fixture {
    backends: Arc<BackendManager>,
    coordinator: Arc<Coordinator>,
    transactions: Arc<TransactionStore>,
    locks: Arc<LockStore>,
    log: Arc<CompensationLog>,
    database: Arc<Database>,
    rm: Arc<MemoryShard>,
    scheduled: Option<mpsc::UnboundedReceiver<Xid>>,
}

async fn fixture() -> Fixture {
    let backends = Arc::new(BackendManager::new());
    let mut partitions = Vec::new();
    for i in 0..PARTITIONS {
        let name = format!("tm_{}", i);
        let shard = MemoryShard::new(&name, Duration::from_secs(1));
        backends.register(Pool::new(&name, shard, 16, Duration::from_secs(1)));
        partitions.push(name);
    }
    let rm = MemoryShard::new("rm_0", Duration::from_secs(1));
    backends.register(Pool::new("rm_0", rm.clone(), 16, Duration::from_secs(1)));

    let transactions = Arc::new(TransactionStore::new(backends.clone(), partitions.clone()).unwrap());
    let locks = Arc::new(LockStore::new(backends.clone(), partitions).unwrap());
    transactions.install().await.unwrap();
    locks.install().await.unwrap();
    let log = Arc::new(CompensationLog::new(backends.clone()));
    log.install("rm_0").await.unwrap();

    let (tx, scheduled) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(
        Arc::new(IdGenerator::new(2, 1).unwrap()),
        transactions.clone(),
        locks.clone(),
    )
    .with_rollback_scheduler(Arc::new(tx));

    let mut database = Database::new();
    database.add_table(Arc::new(RawTable::new(
        "users",
        vec!["id".into()],
        ShardRef::new("rm_0", "users"),
    )));

    let mut conn = rm.connection();
    conn.execute(&Statement::create_table("users", &["id"]))
        .await
        .unwrap();
    conn.execute(&Statement::insert("users", user(7, "a")))
        .await
        .unwrap();

    Fixture {
        backends,
        coordinator: Arc::new(coordinator),
        transactions,
        locks,
        log,
        database: Arc::new(database),
        rm,
        scheduled: Some(scheduled),
    }
}

fn user(id: i64, name: &str) -> Row {
    Row::from([
        ("id".to_string(), Value::Integer(id)),
        ("name".to_string(), Value::Text(name.to_string())),
        (VERSION_COLUMN.to_string(), Value::Integer(0)),
    ])
}

fn key(id: i64) -> LockKey {
    LockKey::new(Row::from([("id".to_string(), Value::Integer(id))]))
}

fn by_id(id: i64) -> Vec<Predicate> {
    vec![Predicate::Eq("id".into(), Value::Integer(id))]
}

fn rename(id: i64, name: &str) -> Statement {
    Statement::update(
        "users",
        Row::from([("name".to_string(), Value::Text(name.to_string()))]),
        by_id(id),
    )
}

impl Fixture {
    fn participant(&self) -> Participant {
        Participant::new(
            self.database.clone(),
            self.backends.clone(),
            Arc::new(LocalCoordinatorClient::new(self.coordinator.clone())),
        )
    }

    fn rollback_worker(&self, config: RollbackConfig) -> RollbackWorker {
        RollbackWorker::new(
            self.transactions.clone(),
            self.locks.clone(),
            self.backends.clone(),
            config,
        )
    }

    fn cleanup_worker(&self) -> CleanupWorker {
        CleanupWorker::new(
            self.transactions.clone(),
            self.locks.clone(),
            self.log.clone(),
            CleanupConfig::default(),
        )
    }

    fn user_row(&self, id: i64) -> Option<Row> {
        self.rm
            .rows("users")
            .into_iter()
            .find(|row| row["id"] == Value::Integer(id))
    }

    async fn status(&self, xid: Xid) -> Option<TransactionStatus> {
        self.transactions
            .get(xid)
            .await
            .unwrap()
            .map(|record| record.status)
    }
}

#[tokio::test]
async fn test_resolved_owner_lock_is_stolen() {
    let f = fixture().await;
    for raw in [1001u64, 1002] {
        f.transactions
            .insert(&TransactionRecord::new(Xid::new(raw), "test"))
            .await
            .unwrap();
    }
    let (first, second) = (Xid::new(1001), Xid::new(1002));

    let row = key(5);
    let lock = |xid| f.coordinator.acquire_lock(xid, "rm_0", "users", &row);
    assert_eq!(lock(first).await.unwrap(), LockOutcome::Granted);
    assert_eq!(lock(second).await.unwrap(), LockOutcome::Busy);
    f.coordinator.commit(first).await.unwrap();
    assert_eq!(f.status(first).await, Some(TransactionStatus::Commit));
    assert_eq!(lock(second).await.unwrap(), LockOutcome::Granted);

    // Cleaning the committed owner leaves the stolen lock alone
    assert!(f.cleanup_worker().clean(first).await.unwrap());
    assert_eq!(f.status(first).await, None);
    let owned = f.locks.find_by_xid(second).await.unwrap();
    assert_eq!(owned.len(), 1);
}

#[tokio::test]
async fn test_cleanup_after_steal_removes_logs() {
    let f = fixture().await;
    let mut first = f.participant();
    let first_xid = first.begin().await.unwrap();
    first.execute(&rename(7, "b")).await.unwrap();
    first.commit().await.unwrap();

    // The next writer takes the committed owner's lock over
    let mut second = f.participant();
    let second_xid = second.begin().await.unwrap();
    second.execute(&rename(7, "c")).await.unwrap();
    assert!(f.locks.find_by_xid(first_xid).await.unwrap().is_empty());
    assert_eq!(f.log.list_by_xid("rm_0", first_xid).await.unwrap().len(), 1);

    assert!(f.cleanup_worker().clean(first_xid).await.unwrap());
    assert_eq!(f.status(first_xid).await, None);
    assert!(f.log.list_by_xid("rm_0", first_xid).await.unwrap().is_empty());
    assert_eq!(f.log.list_by_xid("rm_0", second_xid).await.unwrap().len(), 1);
    assert_eq!(f.locks.find_by_xid(second_xid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_rollback_keeps_version_stamp_on_unversioned_row() {
    let f = fixture().await;
    let plain = Row::from([
        ("id".to_string(), Value::Integer(20)),
        ("name".to_string(), Value::Text("plain".into())),
    ]);
    f.rm.connection()
        .execute(&Statement::insert("users", plain.clone()))
        .await
        .unwrap();

    let mut p = f.participant();
    let xid = p.begin().await.unwrap();
    p.execute(&rename(20, "changed")).await.unwrap();
    p.rollback().await.unwrap();

    let worker = f.rollback_worker(RollbackConfig::default());
    assert_eq!(
        worker.replay(xid).await.unwrap(),
        ReplayOutcome::RolledBack { rows: 1 }
    );

    // Only columns of the before-image are restored
    let row = f.user_row(20).unwrap();
    assert_eq!(row["name"], Value::Text("plain".into()));
    assert_eq!(row[VERSION_COLUMN], Value::Integer(xid.as_u64() as i64));
    assert_eq!(row.len(), plain.len() + 1);
}

#[tokio::test]
async fn test_update_rollback_restores_row() {
    let mut f = fixture().await;
    let mut p = f.participant();
    let xid = p.begin().await.unwrap();
    p.execute(&rename(7, "b")).await.unwrap();
    assert_eq!(f.user_row(7).unwrap()["name"], Value::Text("b".into()));

    p.rollback().await.unwrap();
    assert_eq!(f.status(xid).await, Some(TransactionStatus::Rollbacking));
    let mut scheduled = f.scheduled.take().unwrap();
    assert_eq!(scheduled.recv().await, Some(xid));

    let worker = f.rollback_worker(RollbackConfig::default());
    assert_eq!(
        worker.replay(xid).await.unwrap(),
        ReplayOutcome::RolledBack { rows: 1 }
    );
    assert_eq!(f.user_row(7), Some(user(7, "a")));
    assert_eq!(f.status(xid).await, Some(TransactionStatus::Rollbacked));

    // The restored row is free for the next writer
    let mut next = f.participant();
    next.begin().await.unwrap();
    next.execute(&rename(7, "c")).await.unwrap();
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let f = fixture().await;
    let mut p = f.participant();
    let xid = p.begin().await.unwrap();
    p.execute(&rename(7, "b")).await.unwrap();
    p.execute(&Statement::insert("users", user(8, "new")))
        .await
        .unwrap();
    p.rollback().await.unwrap();

    let worker = Arc::new(f.rollback_worker(RollbackConfig::default()));
    let (left, right) = tokio::join!(worker.replay(xid), worker.replay(xid));
    let mut outcomes = vec![left.unwrap(), right.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, ReplayOutcome::Skipped(_)));
    assert_eq!(
        outcomes,
        vec![
            ReplayOutcome::RolledBack { rows: 2 },
            ReplayOutcome::Skipped(TransactionStatus::Rollbacked)
        ]
    );

    // Crash after reversing rows but before recording ROLLBACKED
    assert_eq!(
        f.transactions
            .transition(
                xid,
                &[TransactionStatus::Rollbacked],
                TransactionStatus::Rollbacking
            )
            .await
            .unwrap(),
        Transition::Applied {
            previous: TransactionStatus::Rollbacked
        }
    );
    assert_eq!(
        worker.replay(xid).await.unwrap(),
        ReplayOutcome::RolledBack { rows: 0 }
    );
    assert_eq!(f.rm.rows("users"), vec![user(7, "a")]);
    assert_eq!(f.status(xid).await, Some(TransactionStatus::Rollbacked));
}

#[tokio::test]
async fn test_idle_transaction_times_out() {
    let f = fixture().await;
    let mut idle = f.participant();
    let xid = idle.begin().await.unwrap();
    idle.execute(&rename(7, "b")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let worker = f.rollback_worker(RollbackConfig {
        active_timeout: Duration::from_millis(10),
        ..RollbackConfig::default()
    });
    let partition = xid.partition(PARTITIONS);
    assert_eq!(worker.sweep_timeouts(partition).await.unwrap(), 1);
    assert_eq!(f.status(xid).await, Some(TransactionStatus::Rollbacking));

    assert_eq!(worker.replay_partition(partition).await.unwrap(), 1);
    assert_eq!(f.status(xid).await, Some(TransactionStatus::Rollbacked));
    assert_eq!(f.user_row(7), Some(user(7, "a")));

    // The expired owner no longer blocks the row
    let mut next = f.participant();
    next.begin().await.unwrap();
    next.execute(&rename(7, "c")).await.unwrap();
    assert_eq!(f.user_row(7).unwrap()["name"], Value::Text("c".into()));

    // The timed out client can no longer commit
    assert!(idle.commit().await.is_err());
}

#[tokio::test]
async fn test_insert_rollback_deletes_row() {
    let f = fixture().await;
    let mut p = f.participant();
    let xid = p.begin().await.unwrap();
    p.execute(&Statement::insert("users", user(9, "fresh")))
        .await
        .unwrap();
    assert!(f.user_row(9).is_some());
    p.rollback().await.unwrap();

    let worker = f.rollback_worker(RollbackConfig::default());
    assert_eq!(
        worker.run_once(xid.partition(PARTITIONS)).await.unwrap(),
        1
    );
    assert!(f.user_row(9).is_none());
    assert_eq!(f.status(xid).await, Some(TransactionStatus::Rollbacked));
}

#[tokio::test]
async fn test_changed_insert_is_an_anomaly() {
    let f = fixture().await;
    let mut p = f.participant();
    let xid = p.begin().await.unwrap();
    p.execute(&Statement::insert("users", user(10, "fresh")))
        .await
        .unwrap();
    p.rollback().await.unwrap();

    f.rm.connection()
        .execute(&rename(10, "tampered"))
        .await
        .unwrap();

    let worker = f.rollback_worker(RollbackConfig::default());
    let err = worker.replay(xid).await.unwrap_err();
    assert!(matches!(err, RecoveryError::DataChanged { .. }));
    assert!(err.is_integrity_incident());

    assert_eq!(
        f.user_row(10).unwrap()["name"],
        Value::Text("tampered".into())
    );
    assert_eq!(f.status(xid).await, Some(TransactionStatus::Rollbacking));
    assert_eq!(
        worker
            .replay_partition(xid.partition(PARTITIONS))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_cleanup_removes_resolved_transactions() {
    let f = fixture().await;

    let mut committed = f.participant();
    let committed_xid = committed.begin().await.unwrap();
    committed.execute(&rename(7, "b")).await.unwrap();
    committed.commit().await.unwrap();

    let mut open = f.participant();
    let open_xid = open.begin().await.unwrap();
    open.execute(&Statement::insert("users", user(11, "open")))
        .await
        .unwrap();

    let cleanup = f.cleanup_worker();
    let mut cleaned = 0;
    for partition in 0..PARTITIONS {
        cleaned += cleanup.clean_partition(partition).await.unwrap();
    }
    assert_eq!(cleaned, 1);

    assert_eq!(f.status(committed_xid).await, None);
    assert!(f.locks.find_by_xid(committed_xid).await.unwrap().is_empty());
    assert!(
        f.log
            .list_by_xid("rm_0", committed_xid)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(f.user_row(7).unwrap()["name"], Value::Text("b".into()));

    assert_eq!(f.status(open_xid).await, Some(TransactionStatus::Active));
    assert!(!cleanup.clean(open_xid).await.unwrap());
    assert_eq!(f.log.list_by_xid("rm_0", open_xid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_workers_finish_rollbacks_in_background() {
    let mut f = fixture().await;
    let workers = Workers::spawn(
        Arc::new(f.rollback_worker(RollbackConfig {
            interval: Duration::from_millis(20),
            ..RollbackConfig::default()
        })),
        Arc::new(CleanupWorker::new(
            f.transactions.clone(),
            f.locks.clone(),
            f.log.clone(),
            CleanupConfig {
                interval: Duration::from_millis(20),
                ..CleanupConfig::default()
            },
        )),
        f.scheduled.take(),
    );

    let mut p = f.participant();
    let xid = p.begin().await.unwrap();
    p.execute(&rename(7, "b")).await.unwrap();
    p.rollback().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while f.status(xid).await.is_some() {
        assert!(tokio::time::Instant::now() < deadline, "{} never cleaned", xid);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(f.user_row(7), Some(user(7, "a")));
    assert!(f.locks.find_by_xid(xid).await.unwrap().is_empty());
    assert!(f.log.list_by_xid("rm_0", xid).await.unwrap().is_empty());

    workers.shutdown().await;
}
