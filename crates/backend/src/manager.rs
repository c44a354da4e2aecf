//! Registry of named backend pools

use crate::{BackendError, Pool, PooledConnection, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of node pools, constructed once at startup and shared by handle
#[derive(Default)]
pub struct BackendManager {
    pools: DashMap<String, Arc<Pool>>,
}

impl BackendManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under its own name, replacing any previous one
    pub fn register(&self, pool: Arc<Pool>) {
        tracing::debug!("Registering backend node {}", pool.name());
        self.pools.insert(pool.name().to_string(), pool);
    }

    pub fn get(&self, node: &str) -> Result<Arc<Pool>> {
        self.pools
            .get(node)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackendError::UnknownNode(node.to_string()))
    }

    /// Acquire a connection to `node`
    pub async fn acquire(&self, node: &str) -> Result<PooledConnection> {
        let pool = self.get(node)?;
        pool.acquire().await
    }

    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }
}
