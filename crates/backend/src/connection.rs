//! Connection traits implemented by shard backends

use crate::{QueryResult, Result, Statement};
use async_trait::async_trait;

/// A single session against one shard.
///
/// Outside an explicit transaction every statement autocommits.
#[async_trait]
pub trait Connection: Send {
    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn execute(&mut self, statement: &Statement) -> Result<QueryResult>;

    /// Whether an explicit transaction is open on this connection
    fn in_transaction(&self) -> bool;
}

/// Opens new connections for a pool
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}
