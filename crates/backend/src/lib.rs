//! Shard execution backend for a2pc
//!
//! This crate defines the contract the transaction layer uses to run
//! statements against a shard:
//! - A typed `Statement` model with SQL rendering
//! - `Connection` and `Connector` traits implemented by concrete backends
//! - A bounded `Pool` whose `PooledConnection` guard returns the connection
//!   on every exit path
//! - A `BackendManager` registry of named pools
//! - `MemoryShard`, an in-memory backend with row locks and transactional undo

mod connection;
mod error;
mod manager;
mod memory;
mod pool;
mod statement;

pub use connection::{Connection, Connector};
pub use error::{BackendError, ER_DUP_ENTRY, ER_LOCK_WAIT_TIMEOUT, Result};
pub use manager::BackendManager;
pub use memory::{MemoryConnection, MemoryShard};
pub use pool::{Pool, PooledConnection};
pub use statement::{Predicate, QueryResult, Statement};
