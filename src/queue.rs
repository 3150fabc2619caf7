// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable FIFO lanes with dequeue-with-commit semantics.
//!
//! Packs waiting for upload and downloaded packs waiting to be applied sit
//! in named lanes of one SQLite table. Delivery is at-least-once:
//!
//! ```text
//!   enqueue ──► NEW ──dequeue_with_commit──► DEQUEUED ──commit──► (removed)
//!                ▲                               │
//!                └──────cancel (tail, +1)────────┘
//! ```
//!
//! The DEQUEUED state lives in memory only. After a crash every entry is
//! NEW again and gets redelivered, which the idempotent applier absorbs.
//! Within a process, a lease whose holder went away (a dropped run, an
//! error between dequeue and release) is handed back by
//! [`DurableQueue::release_leases`], which each pump calls before draining.

use crate::db::execute_with_retry;
use crate::error::{JournalError, Result};
use sqlx::sqlite::SqlitePool;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Boxed future returned by [`DurableQueue`] methods.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Lane suffix for packs waiting to be uploaded.
pub const UPLOAD_LANE_SUFFIX: &str = "upload";

/// Lane suffix for downloaded packs waiting to be applied.
pub const PARSE_LANE_SUFFIX: &str = "parse";

/// Lane name for a checkpoint key and suffix.
pub fn lane_name(checkpoint_key: &str, suffix: &str) -> String {
    format!("{}:{}", checkpoint_key, suffix)
}

/// A leased queue entry.
///
/// Must be released with [`DurableQueue::commit`] or [`DurableQueue::cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: i64,
    pub value: Vec<u8>,
    /// Entries still waiting behind this one.
    pub pending_items: usize,
    /// How many times this entry was cancelled before.
    pub cancel_count: u32,
}

/// A persistent, crash-safe FIFO lane.
pub trait DurableQueue: Send + Sync {
    /// Lane name.
    fn lane(&self) -> &str;

    fn enqueue(&self, value: Vec<u8>) -> QueueFuture<'_, ()>;

    /// Lease the oldest entry not currently leased.
    ///
    /// `None` means the lane is empty right now; it is not an error.
    fn dequeue_with_commit(&self) -> QueueFuture<'_, Option<QueueEntry>>;

    /// Permanently remove a leased entry.
    fn commit(&self, key: i64) -> QueueFuture<'_, ()>;

    /// Return a leased entry to the tail and bump its cancel counter.
    fn cancel(&self, key: i64) -> QueueFuture<'_, ()>;

    /// Return every leased entry to NEW without bumping its counter.
    ///
    /// Only safe while no lease holder can still be running. Returns the
    /// number of leases released.
    fn release_leases(&self) -> QueueFuture<'_, usize>;

    /// Drop every entry of the lane, leased or not.
    fn erase_all(&self) -> QueueFuture<'_, ()>;

    /// Number of entries on the lane, leased ones included.
    fn len(&self) -> QueueFuture<'_, usize>;
}

/// [`DurableQueue`] lane stored in the `journal_queue` table.
pub struct SqliteQueue {
    pool: SqlitePool,
    lane: String,
    leased: Mutex<HashSet<i64>>,
}

impl SqliteQueue {
    /// Open a lane, creating the shared table if needed.
    pub async fn open(pool: SqlitePool, lane: impl Into<String>) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS journal_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lane TEXT NOT NULL,
                position INTEGER NOT NULL,
                value BLOB NOT NULL,
                cancel_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_journal_queue_lane ON journal_queue (lane, position)")
            .execute(&pool)
            .await?;

        let queue = Self {
            pool,
            lane: lane.into(),
            leased: Mutex::new(HashSet::new()),
        };

        let (pending,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM journal_queue WHERE lane = ?")
            .bind(&queue.lane)
            .fetch_one(&queue.pool)
            .await?;
        if pending > 0 {
            debug!(lane = %queue.lane, pending, "Lane has entries from a previous run");
        }

        Ok(queue)
    }

    async fn release(&self, key: i64, operation: &str) -> Result<()> {
        if !self.leased.lock().await.contains(&key) {
            return Err(JournalError::InvalidState {
                expected: format!("entry {} leased on lane {}", key, self.lane),
                actual: format!("{} of an entry that was never dequeued", operation),
            });
        }
        Ok(())
    }
}

impl DurableQueue for SqliteQueue {
    fn lane(&self) -> &str {
        &self.lane
    }

    fn enqueue(&self, value: Vec<u8>) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            let lane = &self.lane;
            let value = &value;
            let now = chrono::Utc::now().timestamp_millis();

            execute_with_retry("queue_enqueue", || async {
                sqlx::query(
                    r#"
                    INSERT INTO journal_queue (lane, position, value, cancel_count, created_at)
                    SELECT ?, COALESCE(MAX(position), 0) + 1, ?, 0, ?
                    FROM journal_queue WHERE lane = ?
                    "#,
                )
                .bind(lane)
                .bind(value)
                .bind(now)
                .bind(lane)
                .execute(pool)
                .await
            })
            .await?;

            debug!(lane = %self.lane, bytes = value.len(), "Enqueued entry");
            Ok(())
        })
    }

    fn dequeue_with_commit(&self) -> QueueFuture<'_, Option<QueueEntry>> {
        Box::pin(async move {
            let mut leased = self.leased.lock().await;

            let rows: Vec<(i64, i64)> = sqlx::query_as(
                "SELECT id, cancel_count FROM journal_queue WHERE lane = ? ORDER BY position ASC",
            )
            .bind(&self.lane)
            .fetch_all(&self.pool)
            .await?;

            let available: Vec<(i64, i64)> = rows.into_iter().filter(|(id, _)| !leased.contains(id)).collect();
            let Some(&(key, cancel_count)) = available.first() else {
                return Ok(None);
            };

            let (value,): (Vec<u8>,) = sqlx::query_as("SELECT value FROM journal_queue WHERE id = ?")
                .bind(key)
                .fetch_one(&self.pool)
                .await?;

            leased.insert(key);
            Ok(Some(QueueEntry {
                key,
                value,
                pending_items: available.len() - 1,
                cancel_count: u32::try_from(cancel_count).unwrap_or(u32::MAX),
            }))
        })
    }

    fn commit(&self, key: i64) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            self.release(key, "commit").await?;
            let pool = &self.pool;

            execute_with_retry("queue_commit", || async {
                sqlx::query("DELETE FROM journal_queue WHERE id = ?")
                    .bind(key)
                    .execute(pool)
                    .await
            })
            .await?;

            self.leased.lock().await.remove(&key);
            debug!(lane = %self.lane, key, "Committed entry");
            Ok(())
        })
    }

    fn cancel(&self, key: i64) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            self.release(key, "cancel").await?;
            let pool = &self.pool;
            let lane = &self.lane;

            execute_with_retry("queue_cancel", || async {
                sqlx::query(
                    r#"
                    UPDATE journal_queue SET
                        cancel_count = cancel_count + 1,
                        position = (SELECT COALESCE(MAX(position), 0) + 1 FROM journal_queue WHERE lane = ?)
                    WHERE id = ?
                    "#,
                )
                .bind(lane)
                .bind(key)
                .execute(pool)
                .await
            })
            .await?;

            self.leased.lock().await.remove(&key);
            warn!(lane = %self.lane, key, "Cancelled entry, returned to lane tail");
            crate::metrics::record_queue_cancel(&self.lane);
            Ok(())
        })
    }

    fn release_leases(&self) -> QueueFuture<'_, usize> {
        Box::pin(async move {
            let mut leased = self.leased.lock().await;
            let released = leased.len();
            if released > 0 {
                warn!(lane = %self.lane, released, "Releasing leases abandoned by an earlier run");
                leased.clear();
            }
            Ok(released)
        })
    }

    fn erase_all(&self) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            let mut leased = self.leased.lock().await;
            let pool = &self.pool;
            let lane = &self.lane;

            let result = execute_with_retry("queue_erase", || async {
                sqlx::query("DELETE FROM journal_queue WHERE lane = ?")
                    .bind(lane)
                    .execute(pool)
                    .await
            })
            .await?;

            leased.clear();
            debug!(lane = %self.lane, removed = result.rows_affected(), "Erased lane");
            Ok(())
        })
    }

    fn len(&self) -> QueueFuture<'_, usize> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM journal_queue WHERE lane = ?")
                .bind(&self.lane)
                .fetch_one(&self.pool)
                .await?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }
}
