//! Background recovery for a2pc
//!
//! - `RollbackWorker` rolls back idle ACTIVE transactions and replays the
//!   compensation logs of ROLLBACKING ones until they reach ROLLBACKED
//! - `CleanupWorker` deletes locks, logs and status rows of COMMIT and
//!   ROLLBACKED transactions
//! - `Workers` runs both per partition on fixed intervals

mod cleanup;
mod error;
mod reverse;
mod rollback;
mod runner;

pub use cleanup::{CleanupConfig, CleanupWorker};
pub use error::{RecoveryError, Result};
pub use reverse::Reversal;
pub use rollback::{ReplayOutcome, RollbackConfig, RollbackWorker};
pub use runner::Workers;
