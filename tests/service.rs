//! The assembled service: HTTP frontend, participants and background workers

use a2pc::{Config, Service};
use a2pc_backend::{Predicate, Statement};
use a2pc_client::{CoordinatorClient, HttpCoordinatorClient, LockOutcome, status};
use a2pc_common::{LockKey, Row, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const CONFIG: &str = r#"
[[nodes]]
name = "rm_0"
lock_wait_timeout_ms = 500

[coordinator]
partitions = ["tm_0", "tm_1"]

[lock_retry]
attempts = 3
backoff_ms = 10

[rollback]
interval_ms = 20

[cleanup]
interval_ms = 20

[id]
worker_id = 3

[[tables]]
name = "users"
kind = "raw"
lock_columns = ["id"]
backend = { node = "rm_0", table = "users" }
"#;

fn user(id: i64, name: &str) -> Row {
    Row::from([
        ("id".to_string(), Value::Integer(id)),
        ("name".to_string(), Value::Text(name.to_string())),
    ])
}

async fn service() -> Service {
    let service = Service::build(Config::parse(CONFIG).unwrap())
        .await
        .unwrap();
    let mut conn = service.backends().acquire("rm_0").await.unwrap();
    conn.execute(&Statement::create_table("users", &["id"]))
        .await
        .unwrap();
    conn.execute(&Statement::insert("users", user(1, "before")))
        .await
        .unwrap();
    service
}

async fn read_user(service: &Service, id: i64) -> Option<Row> {
    let mut conn = service.backends().acquire("rm_0").await.unwrap();
    conn.execute(&Statement::select(
        "users",
        vec![Predicate::Eq("id".into(), Value::Integer(id))],
    ))
    .await
    .unwrap()
    .into_rows()
    .pop()
}

#[tokio::test]
async fn test_http_frontend() {
    let service = service().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(service.run(listener, async {
        let _ = stopped.await;
    }));

    let client =
        HttpCoordinatorClient::new(vec![format!("http://{}", addr)], Duration::from_secs(5))
            .unwrap();
    let xid = client.begin("http-test").await.unwrap();
    let key = LockKey::new(Row::from([("id".to_string(), Value::Integer(1))]));
    assert_eq!(
        client
            .acquire_lock(xid, "rm_0", "users", &key, "UPDATE users")
            .await
            .unwrap(),
        LockOutcome::Granted
    );

    let other = client.begin("http-test").await.unwrap();
    assert_eq!(
        client
            .acquire_lock(other, "rm_0", "users", &key, "UPDATE users")
            .await
            .unwrap(),
        LockOutcome::Busy
    );

    client.commit(xid).await.unwrap();
    client.commit(xid).await.unwrap();
    let err = client.rollback(xid).await.unwrap_err();
    assert_eq!(err.code(), status::TRANSACTION_INVALID_STATE);

    let _ = stop.send(());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rollback_is_replayed_and_cleaned() {
    let mut service = service().await;
    service.start_workers();

    let mut participant = service.participant();
    let xid = participant.begin().await.unwrap();
    participant
        .execute(&Statement::update(
            "users",
            Row::from([("name".to_string(), Value::Text("after".into()))]),
            vec![Predicate::Eq("id".into(), Value::Integer(1))],
        ))
        .await
        .unwrap();
    assert_eq!(
        read_user(&service, 1).await.unwrap()["name"],
        Value::Text("after".into())
    );
    participant.rollback().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.transactions().get(xid).await.unwrap().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "{} never cleaned", xid);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        read_user(&service, 1).await.unwrap()["name"],
        Value::Text("before".into())
    );

    // The row is free again
    let mut next = service.participant();
    next.begin().await.unwrap();
    next.execute(&Statement::delete(
        "users",
        vec![Predicate::Eq("id".into(), Value::Integer(1))],
    ))
    .await
    .unwrap();
    next.commit().await.unwrap();
    assert!(read_user(&service, 1).await.is_none());

    service.stop_workers().await;
}
