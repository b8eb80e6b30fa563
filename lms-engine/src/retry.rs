//! Bounded retry for transient database lock contention
//!
//! SQLite admits one writer at a time; under concurrent enrollment and
//! progress traffic a write can fail with "database is locked" even with
//! the busy timeout set. Those failures are retried with exponential
//! backoff up to a small bounded attempt count. Every mutating operation
//! in this crate is idempotent, so a caller that still sees the transient
//! failure can safely re-run the whole operation.

use lms_common::db::init::setting_i64;
use lms_common::{Error, Result};
use sqlx::SqlitePool;
use std::time::Duration;

const BACKOFF_CAP_MS: u64 = 500;

/// Retry budget for lock-contended writes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 10,
        }
    }
}

impl RetryPolicy {
    /// Load the budget from the settings table, falling back to defaults
    pub async fn load(pool: &SqlitePool) -> Self {
        let defaults = Self::default();
        let max_attempts = setting_i64(pool, "db_max_lock_attempts", defaults.max_attempts as i64)
            .await
            .unwrap_or(defaults.max_attempts as i64);
        let initial_backoff_ms =
            setting_i64(pool, "db_lock_retry_ms", defaults.initial_backoff_ms as i64)
                .await
                .unwrap_or(defaults.initial_backoff_ms as i64);

        Self {
            max_attempts: max_attempts.clamp(1, 100) as u32,
            initial_backoff_ms: initial_backoff_ms.clamp(1, BACKOFF_CAP_MS as i64) as u64,
        }
    }
}

/// Run a database operation, retrying lock-contention failures.
///
/// Only errors classified by [`Error::is_busy`] are retried; anything else
/// propagates immediately. When the attempt budget is exhausted the last
/// failure is surfaced as a transient [`Error::Internal`].
pub async fn retry_on_busy<F, Fut, T>(
    operation_name: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff_ms = policy.initial_backoff_ms;

    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_busy() => return Err(err),
            Err(err) => {
                if attempt == policy.max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        "Database operation failed: retry budget exhausted"
                    );
                    return Err(Error::Internal(format!(
                        "Database locked after {} attempts: {}",
                        attempt, err
                    )));
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(BACKOFF_CAP_MS);
            }
        }
    }

    // Loop always returns on the last attempt
    Err(Error::Internal(format!(
        "Retry loop for '{}' exited without a result",
        operation_name
    )))
}
