//! Participant side of a2pc
//!
//! A `Participant` is bound to one session and one transaction. For every
//! write it takes a global lock per physical row through the coordinator,
//! then runs the write, the before/after image reads and the compensation
//! log upsert in one local transaction on each shard the row maps to.
//!
//! Routing comes from `Table` implementations held in a `Database`.

mod error;
mod participant;
mod retry;
mod table;

pub use error::{ParticipantError, Result};
pub use participant::{Participant, ParticipantState, VERSION_COLUMN};
pub use retry::LockRetryPolicy;
pub use table::{
    Database, DoubleShardingTable, NumberedBackend, RawTable, ShardRef, ShardingStrategy,
    ShardingTable, StrategyConfig, Table, TableConfig, TableKind,
};
