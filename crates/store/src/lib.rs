//! Persistent state of the transaction layer
//!
//! Three tables hold everything the coordinator and the recovery workers
//! share:
//! - `transaction_info_{n}`: one status row per transaction, partitioned by `xid mod N`
//! - `lock_table_{n}`: global row locks, partitioned by `hash(lock_key) mod N`
//! - `reundo_log`: per-row undo/redo images, kept on the data node that owns the row
//!
//! All access goes through pooled shard connections; row-level locking on
//! these tables is the only synchronization between coordinator processes.

mod compensation;
mod error;
mod lock;
mod row;
mod transaction;

pub use compensation::{COMPENSATION_TABLE, CompensationLog, CompensationRecord, ReUndoLog};
pub use error::{Result, StoreError};
pub use lock::{LockClaim, LockRecord, LockStore};
pub use transaction::{LockedTransaction, TransactionRecord, TransactionStore, Transition};
