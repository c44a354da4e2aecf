//! HTTP client for coordinator replicas

use crate::{ClientError, CoordinatorClient, LockOutcome, Result};
use a2pc_common::{LockKey, Xid};
use a2pc_coordinator::protocol::{Request, Response};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Talks to coordinator replicas over `PUT /transactions`.
///
/// Calls about an existing transaction go to replica `xid mod n`; BEGIN
/// rotates over the replicas.
pub struct HttpCoordinatorClient {
    http: reqwest::Client,
    replicas: Vec<String>,
    next_begin: AtomicUsize,
}

impl HttpCoordinatorClient {
    /// `replicas` are base URLs such as `http://10.0.0.1:9000`
    pub fn new(replicas: Vec<String>, timeout: Duration) -> Result<Self> {
        if replicas.is_empty() {
            return Err(ClientError::NoReplicas);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            replicas: replicas
                .into_iter()
                .map(|r| r.trim_end_matches('/').to_string())
                .collect(),
            next_begin: AtomicUsize::new(0),
        })
    }

    /// Replica serving `xid`
    pub fn replica_for(&self, xid: Xid) -> &str {
        &self.replicas[xid.partition(self.replicas.len())]
    }

    fn next_replica(&self) -> &str {
        let index = self.next_begin.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        &self.replicas[index]
    }

    async fn call(&self, replica: &str, request: &Request) -> Result<Response> {
        let url = format!("{}/transactions", replica);
        tracing::trace!("{} {:?} to {}", request.action(), request.xid(), url);
        let response = self
            .http
            .put(&url)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json::<Response>()
            .await?;
        Ok(response)
    }

    async fn call_ok(&self, replica: &str, request: &Request) -> Result<Response> {
        let response = self.call(replica, request).await?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(into_error(response))
        }
    }
}

fn into_error(response: Response) -> ClientError {
    ClientError::Coordinator {
        status: response.status,
        message: response.message.unwrap_or_default(),
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn begin(&self, client_id: &str) -> Result<Xid> {
        let request = Request::Begin {
            client_id: client_id.to_string(),
        };
        let response = self.call_ok(self.next_replica(), &request).await?;
        response
            .xid
            .ok_or_else(|| ClientError::MalformedResponse("BEGIN answered without xid".into()))
    }

    async fn commit(&self, xid: Xid) -> Result<()> {
        self.call_ok(self.replica_for(xid), &Request::Commit { xid })
            .await?;
        Ok(())
    }

    async fn rollback(&self, xid: Xid) -> Result<()> {
        self.call_ok(self.replica_for(xid), &Request::Rollback { xid })
            .await?;
        Ok(())
    }

    async fn acquire_lock(
        &self,
        xid: Xid,
        node: &str,
        table: &str,
        lock_key: &LockKey,
        context: &str,
    ) -> Result<LockOutcome> {
        let request = Request::AcquireLock {
            xid,
            node: node.to_string(),
            table: table.to_string(),
            lock_key: lock_key.clone(),
            context: context.to_string(),
        };
        let response = self.call(self.replica_for(xid), &request).await?;
        if response.is_ok() {
            Ok(LockOutcome::Granted)
        } else if response.is_busy() {
            Ok(LockOutcome::Busy)
        } else {
            Err(into_error(response))
        }
    }
}
