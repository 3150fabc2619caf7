// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite plumbing shared by the checkpoint store and the queue lanes.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended (another process holding the vault open, a backup tool).
//! Every write goes through [`execute_with_retry`]:
//! - Automatic retry with exponential backoff
//! - Capped at [`SQLITE_RETRY_MAX_ATTEMPTS`]
//! - Non-busy errors are returned immediately

use crate::config::StorageConfig;
use crate::error::{JournalError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Path value that selects a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// Attempts a journal write gets while the database is contended.
pub const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY: Duration = Duration::from_millis(10);
const SQLITE_RETRY_MAX_DELAY: Duration = Duration::from_millis(500);

/// SQLITE_BUSY and SQLITE_LOCKED primary result codes.
const CONTENDED_CODES: [&str; 2] = ["5", "6"];

/// Whether a failed statement lost a lock race rather than failed outright.
///
/// Drivers that omit the result code are matched on the message instead.
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = e else {
        return false;
    };
    match db_err.code() {
        Some(code) => CONTENDED_CODES.contains(&code.as_ref()),
        None => {
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Delay before the attempt following `attempt` (1-based), doubling up to a cap.
fn contended_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    SQLITE_RETRY_BASE_DELAY.saturating_mul(factor).min(SQLITE_RETRY_MAX_DELAY)
}

/// Run a journal write, re-running it while SQLite reports contention.
///
/// `f` builds a fresh statement per attempt. Any other error, or running
/// out of attempts, hands the last error back unchanged.
pub(crate) async fn execute_with_retry<F, Fut, T>(operation: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        let err = match f().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Journal write went through after contention");
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if !is_sqlite_busy_error(&err) {
            return Err(err);
        }
        if attempt >= SQLITE_RETRY_MAX_ATTEMPTS {
            warn!(operation, attempt, "Journal database still contended, giving up");
            return Err(err);
        }

        let delay = contended_delay(attempt);
        warn!(
            operation,
            attempt,
            max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
            delay_ms = delay.as_millis() as u64,
            "Journal database contended, retrying"
        );
        crate::metrics::sqlite_retries_total(operation);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Fold the WAL back into the main database file before closing.
pub async fn truncate_wal(pool: &SqlitePool) -> Result<()> {
    execute_with_retry("wal_checkpoint", || async {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
    })
    .await?;

    debug!("WAL checkpoint complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_row_not_found() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_is_sqlite_busy_error_pool_timed_out() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_contended_delay_doubles_then_caps() {
        assert_eq!(contended_delay(1), Duration::from_millis(10));
        assert_eq!(contended_delay(2), Duration::from_millis(20));
        assert_eq!(contended_delay(4), Duration::from_millis(80));
        assert_eq!(contended_delay(7), SQLITE_RETRY_MAX_DELAY);
        assert_eq!(contended_delay(40), SQLITE_RETRY_MAX_DELAY);
    }

    #[tokio::test]
    async fn test_in_memory_pool_keeps_tables() {
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        sqlx::query("CREATE TABLE t (x INTEGER)").execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO t (x) VALUES (1)").execute(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_file_pool_and_wal_truncate() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            sqlite_path: dir.path().join("journal.db").to_string_lossy().to_string(),
            wal_mode: true,
        };
        let pool = open_pool(&config).await.unwrap();
        sqlx::query("CREATE TABLE t (x INTEGER)").execute(&pool).await.unwrap();

        assert!(truncate_wal(&pool).await.is_ok());
        pool.close().await;
    }
}
