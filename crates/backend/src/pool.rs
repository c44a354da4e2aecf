//! Bounded connection pool with scoped release

use crate::{BackendError, Connection, Connector, Result};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool of connections to one named node
pub struct Pool {
    name: String,
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl Pool {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        max_connections: usize,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            connector,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            acquire_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire a connection, waiting at most the pool's acquire timeout.
    ///
    /// The returned guard gives the connection back when dropped.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| BackendError::AcquireTimeout(self.name.clone()))?
            .map_err(|_| BackendError::AcquireTimeout(self.name.clone()))?;

        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                tracing::debug!("Opening new connection to {}", self.name);
                self.connector.connect().await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Number of idle connections ready for reuse
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of connections that can be handed out right now
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn release(&self, conn: Box<dyn Connection>) {
        if conn.in_transaction() {
            tracing::warn!(
                "Discarding connection to {} returned inside a transaction",
                self.name
            );
            return;
        }
        self.idle.lock().push(conn);
    }
}

/// A connection checked out of a `Pool`
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Name of the node this connection talks to
    pub fn node(&self) -> &str {
        self.pool.name()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
