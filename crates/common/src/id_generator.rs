//! Snowflake id generator for transaction ids.
//!
//! Layout of a generated id (63 significant bits):
//!
//! ```text
//! | 41 bits: ms since EPOCH_MS | 5 bits: datacenter | 5 bits: worker | 12 bits: sequence |
//! ```
//!
//! Generation never fails. A clock that moved backwards, or a sequence that
//! overflowed within one millisecond, makes the caller wait until the clock
//! has caught up.

use crate::{Error, Result, Xid};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Custom epoch (2021-01-01T00:00:00+08:00) in milliseconds.
pub const EPOCH_MS: u64 = 1_609_430_400_000;

const WORKER_ID_BITS: u64 = 5;
const DATACENTER_ID_BITS: u64 = 5;
const SEQUENCE_BITS: u64 = 12;

pub const MAX_WORKER_ID: u8 = ((1u64 << WORKER_ID_BITS) - 1) as u8;
pub const MAX_DATACENTER_ID: u8 = ((1u64 << DATACENTER_ID_BITS) - 1) as u8;

const WORKER_ID_SHIFT: u64 = SEQUENCE_BITS;
const DATACENTER_ID_SHIFT: u64 = SEQUENCE_BITS + WORKER_ID_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + WORKER_ID_BITS + DATACENTER_ID_BITS;
const SEQUENCE_MASK: u64 = (1u64 << SEQUENCE_BITS) - 1;

/// Millisecond wall clock used by the generator.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_timestamp: Option<u64>,
    sequence: u64,
}

/// Process-local monotonic id source.
pub struct IdGenerator {
    worker_id: u64,
    datacenter_id: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// Create a generator on the system clock.
    pub fn new(worker_id: u8, datacenter_id: u8) -> Result<Self> {
        Self::with_clock(worker_id, datacenter_id, Arc::new(SystemClock))
    }

    /// Create a generator on a custom clock.
    pub fn with_clock(worker_id: u8, datacenter_id: u8, clock: Arc<dyn Clock>) -> Result<Self> {
        if worker_id > MAX_WORKER_ID {
            return Err(Error::InvalidWorkerId(worker_id));
        }
        if datacenter_id > MAX_DATACENTER_ID {
            return Err(Error::InvalidDatacenterId(datacenter_id));
        }
        Ok(Self {
            worker_id: worker_id as u64,
            datacenter_id: datacenter_id as u64,
            clock,
            state: Mutex::new(GeneratorState::default()),
        })
    }

    /// Generate the next id, waiting out clock regressions and sequence overruns.
    pub async fn next_id(&self) -> Xid {
        loop {
            match self.try_next_id() {
                Ok(xid) => return xid,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Generate the next id, or report how long to wait before trying again.
    pub fn try_next_id(&self) -> std::result::Result<Xid, Duration> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        let sequence = match state.last_timestamp {
            Some(last) if now < last => {
                tracing::warn!("Clock is moving backwards, waiting until {}", last);
                return Err(Duration::from_millis(last - now));
            }
            Some(last) if now == last => {
                let sequence = (state.sequence + 1) & SEQUENCE_MASK;
                if sequence == 0 {
                    tracing::warn!("Id sequence overrun at {}", now);
                    return Err(Duration::from_millis(1));
                }
                sequence
            }
            _ => 0,
        };

        state.last_timestamp = Some(now);
        state.sequence = sequence;

        Ok(Xid::new(
            (now.saturating_sub(EPOCH_MS) << TIMESTAMP_SHIFT)
                | (self.datacenter_id << DATACENTER_ID_SHIFT)
                | (self.worker_id << WORKER_ID_SHIFT)
                | sequence,
        ))
    }
}

/// Unix time in milliseconds at which `xid` was generated.
pub fn timestamp_of(xid: Xid) -> u64 {
    (xid.as_u64() >> TIMESTAMP_SHIFT) + EPOCH_MS
}
