//! Clients for the transaction coordinator
//!
//! Participants talk to the coordinator through the `CoordinatorClient`
//! trait. Two implementations are provided:
//! - `HttpCoordinatorClient` speaks the JSON protocol to a set of coordinator
//!   replicas, picking the replica by `xid`
//! - `LocalCoordinatorClient` calls an in-process `Coordinator` directly

mod error;
mod http;
mod local;

pub use a2pc_coordinator::LockOutcome;
pub use a2pc_coordinator::protocol::status;
pub use error::{ClientError, Result};
pub use http::HttpCoordinatorClient;
pub use local::LocalCoordinatorClient;

use a2pc_common::{LockKey, Xid};
use async_trait::async_trait;

/// Coordinator operations used by a participant
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn begin(&self, client_id: &str) -> Result<Xid>;

    async fn commit(&self, xid: Xid) -> Result<()>;

    async fn rollback(&self, xid: Xid) -> Result<()>;

    /// One lock attempt; `Busy` is not an error
    async fn acquire_lock(
        &self,
        xid: Xid,
        node: &str,
        table: &str,
        lock_key: &LockKey,
        context: &str,
    ) -> Result<LockOutcome>;
}
