//! Common types for a2pc
//!
//! This crate defines:
//! - Transaction ids (`Xid`) and the snowflake `IdGenerator` that mints them
//! - Row values and canonical lock keys
//! - Transaction status and logged operation kinds

mod error;
mod id_generator;
mod lock_key;
mod status;
mod value;
mod xid;

pub use error::{Error, Result};
pub use id_generator::{
    Clock, EPOCH_MS, IdGenerator, MAX_DATACENTER_ID, MAX_WORKER_ID, ManualClock, SystemClock,
    timestamp_of,
};
pub use lock_key::LockKey;
pub use status::{Operation, TransactionStatus};
pub use value::{Row, Value};
pub use xid::Xid;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
