//! Transaction coordinator
//!
//! This crate provides the stateless transaction manager:
//! - `Coordinator`: begin/commit/rollback and global row-lock acquisition,
//!   with all state kept in the partitioned stores
//! - `protocol`: the JSON request/response bodies of `PUT /transactions`
//! - `server`: the axum HTTP frontend

mod coordinator;
mod error;
pub mod protocol;
pub mod server;

pub use coordinator::{Coordinator, LockOutcome, RollbackScheduler};
pub use error::{CoordinatorError, Result};
pub use protocol::{Request, Response};
