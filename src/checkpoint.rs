// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for replication progress and dedup sets.
//!
//! One [`CheckpointInfo`] exists per remote configuration, stored as JSON in
//! SQLite under [`checkpoint_key`]. It survives restarts of the process and
//! is the only progress record shared by the inbound and outbound pipelines.
//!
//! # Update Semantics
//!
//! The checkpoint is an immutable value replaced wholesale:
//!
//! ```text
//! update(f):  lock → next = f(current) → persist next → publish next → unlock
//!                                      (crash here = previous value survives)
//! ```
//!
//! A failed write leaves the previously published value in place, so no
//! reader ever sees a half-applied transform.
//!
//! # Persisted Form
//!
//! Sets are written as JSON arrays (`knownIDs`, `sentIDs`, `receivedFiles`,
//! `sentFiles`) next to `lastLocalSeq`, and materialized back into ordered
//! sets on load. Missing fields default to empty.

use crate::db::execute_with_retry;
use crate::error::Result;
use crate::object_store::compare_pack_names;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Prefix of every checkpoint persistence key.
pub const CHECKPOINT_KEY_PREFIX: &str = "bucketsync-checkpoint-";

/// Persistence key for a remote configuration.
///
/// Fields are length-prefixed before hashing, so the encoding is stable,
/// order-sensitive and free of join ambiguities.
pub fn checkpoint_key(endpoint: &str, bucket: &str, prefix: &str, region: &str) -> String {
    let bucket_and_prefix = format!("{}{}", bucket, prefix);
    let mut hasher = Sha256::new();
    for field in [endpoint, bucket_and_prefix.as_str(), region] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{}{}", CHECKPOINT_KEY_PREFIX, hex::encode(hasher.finalize()))
}

/// Replication progress for one remote configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointInfo {
    /// Last local change-feed position whose records are durably enqueued.
    #[serde(rename = "lastLocalSeq")]
    pub last_local_seq: u64,

    /// Dockeys already applied locally (received or originated).
    #[serde(rename = "knownIDs")]
    pub known_ids: BTreeSet<String>,

    /// Dockeys already packed for upload.
    #[serde(rename = "sentIDs")]
    pub sent_ids: BTreeSet<String>,

    /// Remote pack filenames already consumed.
    #[serde(rename = "receivedFiles")]
    pub received_files: BTreeSet<String>,

    /// Pack filenames this replica uploaded itself.
    #[serde(rename = "sentFiles")]
    pub sent_files: BTreeSet<String>,
}

impl CheckpointInfo {
    /// Whether a dockey must be excluded from packing.
    pub fn is_known_or_sent(&self, dockey: &str) -> bool {
        self.known_ids.contains(dockey) || self.sent_ids.contains(dockey)
    }

    /// Advance `last_local_seq`, never moving it backwards.
    pub fn advance_local_seq(mut self, seq: u64) -> Self {
        self.last_local_seq = self.last_local_seq.max(seq);
        self
    }

    pub fn with_sent_ids<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        self.sent_ids.extend(ids);
        self
    }

    pub fn with_known_ids<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        self.known_ids.extend(ids);
        self
    }

    pub fn with_received_file(mut self, name: impl Into<String>) -> Self {
        self.received_files.insert(name.into());
        self
    }

    pub fn with_sent_file(mut self, name: impl Into<String>) -> Self {
        self.sent_files.insert(name.into());
        self
    }

    /// Greatest consumed filename by embedded timestamp.
    pub fn latest_received_file(&self) -> Option<&str> {
        self.received_files
            .iter()
            .max_by(|a, b| compare_pack_names(a, b))
            .map(String::as_str)
    }
}

/// SQLite-backed checkpoint store with atomic `update`.
pub struct CheckpointStore {
    pool: SqlitePool,
    key: String,
    /// Published value; the mutex also serializes updates.
    current: Mutex<CheckpointInfo>,
}

impl CheckpointStore {
    /// Open (creating if needed) the checkpoint stored under `key`.
    pub async fn open(pool: SqlitePool, key: impl Into<String>) -> Result<Self> {
        let key = key.into();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM checkpoints WHERE key = ?")
            .bind(&key)
            .fetch_optional(&pool)
            .await?;

        let current = match row {
            Some((json,)) => {
                let info: CheckpointInfo = serde_json::from_str(&json)?;
                info!(
                    key = %key,
                    last_local_seq = info.last_local_seq,
                    known = info.known_ids.len(),
                    sent = info.sent_ids.len(),
                    received_files = info.received_files.len(),
                    sent_files = info.sent_files.len(),
                    "Restored checkpoint from previous run"
                );
                info
            }
            None => {
                debug!(key = %key, "No checkpoint yet, starting from defaults");
                CheckpointInfo::default()
            }
        };

        Ok(Self {
            pool,
            key,
            current: Mutex::new(current),
        })
    }

    /// Persistence key of this checkpoint.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current checkpoint value.
    pub async fn get(&self) -> CheckpointInfo {
        self.current.lock().await.clone()
    }

    /// Replace the checkpoint with `transform(current)`.
    ///
    /// The new value is persisted before it becomes visible; on error the
    /// previous value stays published.
    pub async fn update<F>(&self, transform: F) -> Result<CheckpointInfo>
    where
        F: FnOnce(CheckpointInfo) -> CheckpointInfo,
    {
        let mut current = self.current.lock().await;
        let next = transform(current.clone());
        if next != *current {
            self.persist(&next).await?;
            *current = next;
        }
        Ok(current.clone())
    }

    /// Restore defaults.
    pub async fn reset(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        let fresh = CheckpointInfo::default();
        self.persist(&fresh).await?;
        *current = fresh;
        info!(key = %self.key, "Checkpoint reset");
        Ok(())
    }

    async fn persist(&self, info: &CheckpointInfo) -> Result<()> {
        let json = serde_json::to_string(info)?;
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let key = &self.key;

        execute_with_retry("checkpoint_persist", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (key, value, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(&json)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        crate::metrics::record_checkpoint_persist(info.last_local_seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::db::open_pool;
    use tempfile::tempdir;

    async fn memory_store(key: &str) -> CheckpointStore {
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        CheckpointStore::open(pool, key).await.unwrap()
    }

    #[test]
    fn test_checkpoint_key_is_stable_and_order_sensitive() {
        let a = checkpoint_key("https://s3", "bucket", "p/", "eu");
        assert_eq!(a, checkpoint_key("https://s3", "bucket", "p/", "eu"));
        assert!(a.starts_with(CHECKPOINT_KEY_PREFIX));
        assert_ne!(a, checkpoint_key("eu", "bucket", "p/", "https://s3"));
        assert_ne!(a, checkpoint_key("https://s3", "bucket", "q/", "eu"));
    }

    #[test]
    fn test_checkpoint_key_bucket_prefix_joined() {
        // bucket and prefix are joined before hashing
        assert_eq!(
            checkpoint_key("e", "bucket", "p/", "r"),
            checkpoint_key("e", "bucketp/", "", "r")
        );
    }

    #[test]
    fn test_persisted_form_uses_array_fields() {
        let info = CheckpointInfo::default()
            .advance_local_seq(7)
            .with_known_ids(["a-1-x".to_string()])
            .with_sent_file("100-docs.jsonl.gz");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["lastLocalSeq"], 7);
        assert_eq!(json["knownIDs"], serde_json::json!(["a-1-x"]));
        assert_eq!(json["sentFiles"], serde_json::json!(["100-docs.jsonl.gz"]));
    }

    #[test]
    fn test_materializes_sets_from_arrays_with_duplicates() {
        let json = r#"{"lastLocalSeq": 3, "knownIDs": ["a", "a", "b"]}"#;
        let info: CheckpointInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.last_local_seq, 3);
        assert_eq!(info.known_ids.len(), 2);
        assert!(info.sent_ids.is_empty());
        assert!(info.received_files.is_empty());
    }

    #[test]
    fn test_advance_local_seq_is_monotonic() {
        let info = CheckpointInfo::default().advance_local_seq(10).advance_local_seq(4);
        assert_eq!(info.last_local_seq, 10);
    }

    #[test]
    fn test_latest_received_file_is_numeric_aware() {
        let info = CheckpointInfo::default()
            .with_received_file("999-docs.jsonl.gz")
            .with_received_file("1000-docs.jsonl.gz");
        assert_eq!(info.latest_received_file(), Some("1000-docs.jsonl.gz"));
        assert_eq!(CheckpointInfo::default().latest_received_file(), None);
    }

    #[test]
    fn test_is_known_or_sent() {
        let info = CheckpointInfo::default()
            .with_known_ids(["k".to_string()])
            .with_sent_ids(["s".to_string()]);
        assert!(info.is_known_or_sent("k"));
        assert!(info.is_known_or_sent("s"));
        assert!(!info.is_known_or_sent("other"));
    }

    #[tokio::test]
    async fn test_get_defaults_on_first_use() {
        let store = memory_store("cp").await;
        assert_eq!(store.get().await, CheckpointInfo::default());
        assert_eq!(store.key(), "cp");
    }

    #[tokio::test]
    async fn test_update_returns_and_publishes_new_value() {
        let store = memory_store("cp").await;
        let updated = store
            .update(|c| c.advance_local_seq(5).with_sent_ids(["x-1-a".to_string()]))
            .await
            .unwrap();
        assert_eq!(updated.last_local_seq, 5);
        assert_eq!(store.get().await, updated);
    }

    #[tokio::test]
    async fn test_reset_restores_defaults() {
        let store = memory_store("cp").await;
        store.update(|c| c.advance_local_seq(9).with_received_file("1-docs.jsonl.gz")).await.unwrap();
        store.reset().await.unwrap();
        assert_eq!(store.get().await, CheckpointInfo::default());
    }

    #[tokio::test]
    async fn test_checkpoint_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            sqlite_path: dir.path().join("journal.db").to_string_lossy().to_string(),
            wal_mode: true,
        };

        {
            let pool = open_pool(&config).await.unwrap();
            let store = CheckpointStore::open(pool.clone(), "cp").await.unwrap();
            store
                .update(|c| c.advance_local_seq(42).with_known_ids(["a-1-x".to_string()]))
                .await
                .unwrap();
            pool.close().await;
        }

        {
            let pool = open_pool(&config).await.unwrap();
            let store = CheckpointStore::open(pool.clone(), "cp").await.unwrap();
            let info = store.get().await;
            assert_eq!(info.last_local_seq, 42);
            assert!(info.known_ids.contains("a-1-x"));
            pool.close().await;
        }
    }

    #[tokio::test]
    async fn test_checkpoints_are_isolated_by_key() {
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        let a = CheckpointStore::open(pool.clone(), "a").await.unwrap();
        let b = CheckpointStore::open(pool.clone(), "b").await.unwrap();
        a.update(|c| c.advance_local_seq(3)).await.unwrap();

        let b_reopened = CheckpointStore::open(pool, "b").await.unwrap();
        assert_eq!(b.get().await.last_local_seq, 0);
        assert_eq!(b_reopened.get().await.last_local_seq, 0);
    }
}
