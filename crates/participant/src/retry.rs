//! Bounded retry of busy global locks

use crate::{ParticipantError, Result};
use a2pc_client::{CoordinatorClient, LockOutcome};
use a2pc_common::{LockKey, Xid};
use std::time::Duration;
use tokio::time::Instant;

/// How long a statement keeps asking for a busy lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Fixed pause between attempts
    pub backoff: Duration,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_millis(100),
        }
    }
}

/// One lock request with its retry budget
pub(crate) struct LockRequest<'a> {
    pub xid: Xid,
    pub node: &'a str,
    pub table: &'a str,
    pub lock_key: &'a LockKey,
    pub context: &'a str,
}

impl LockRetryPolicy {
    /// Ask for the lock until granted, the attempts run out or `deadline`
    /// passes. Dropping the returned future abandons the wait.
    pub(crate) async fn acquire(
        &self,
        client: &dyn CoordinatorClient,
        request: LockRequest<'_>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = client
                .acquire_lock(
                    request.xid,
                    request.node,
                    request.table,
                    request.lock_key,
                    request.context,
                )
                .await?;
            if outcome == LockOutcome::Granted {
                if attempt > 1 {
                    tracing::debug!(
                        "{} got lock {} on {}.{} after {} attempts",
                        request.xid,
                        request.lock_key,
                        request.node,
                        request.table,
                        attempt
                    );
                }
                return Ok(());
            }

            let wake = Instant::now() + self.backoff;
            if attempt >= attempts || deadline.is_some_and(|d| wake > d) {
                tracing::warn!(
                    "{} gave up on lock {} on {}.{} after {} attempts",
                    request.xid,
                    request.lock_key,
                    request.node,
                    request.table,
                    attempt
                );
                return Err(ParticipantError::LockTimeout {
                    lock_key: request.lock_key.to_string(),
                    node: request.node.to_string(),
                    table: request.table.to_string(),
                    attempts: attempt,
                });
            }
            tokio::time::sleep_until(wake).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a2pc_common::{Row, Value};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Busy for the first `busy_for` attempts
    struct Contended {
        busy_for: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CoordinatorClient for Contended {
        async fn begin(&self, _client_id: &str) -> a2pc_client::Result<Xid> {
            Ok(Xid::new(1))
        }

        async fn commit(&self, _xid: Xid) -> a2pc_client::Result<()> {
            Ok(())
        }

        async fn rollback(&self, _xid: Xid) -> a2pc_client::Result<()> {
            Ok(())
        }

        async fn acquire_lock(
            &self,
            _xid: Xid,
            _node: &str,
            _table: &str,
            _lock_key: &LockKey,
            _context: &str,
        ) -> a2pc_client::Result<LockOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.busy_for {
                Ok(LockOutcome::Busy)
            } else {
                Ok(LockOutcome::Granted)
            }
        }
    }

    fn key() -> LockKey {
        LockKey::new(Row::from([("id".to_string(), Value::Integer(5))]))
    }

    fn request(key: &LockKey) -> LockRequest<'_> {
        LockRequest {
            xid: Xid::new(1002),
            node: "rm_0",
            table: "users",
            lock_key: key,
            context: "",
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_after_busy_attempts() {
        let client = Contended {
            busy_for: 3,
            calls: AtomicU32::new(0),
        };
        let k = key();
        LockRetryPolicy::default()
            .acquire(&client, request(&k), None)
            .await
            .unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_is_lock_timeout() {
        let client = Contended {
            busy_for: 100,
            calls: AtomicU32::new(0),
        };
        let k = key();
        let started = Instant::now();
        let err = LockRetryPolicy::default()
            .acquire(&client, request(&k), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ParticipantError::LockTimeout { attempts: 10, .. }));
        assert_eq!(err.code(), 1005);
        assert_eq!(client.calls.load(Ordering::SeqCst), 10);
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_the_wait_short() {
        let client = Contended {
            busy_for: 100,
            calls: AtomicU32::new(0),
        };
        let k = key();
        let deadline = Instant::now() + Duration::from_millis(250);
        let err = LockRetryPolicy::default()
            .acquire(&client, request(&k), Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, ParticipantError::LockTimeout { attempts: 3, .. }));
    }
}
