// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for journal sync.
//!
//! Configuration is passed to [`JournalSync::open()`](crate::JournalSync::open)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use journal_sync::config::{JournalSyncConfig, RemoteConfig};
//!
//! let config = JournalSyncConfig {
//!     remote: RemoteConfig::for_testing("notes"),
//!     ..Default::default()
//! };
//! assert_eq!(config.settings.packer.max_pack_records, 250);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! JournalSyncConfig
//! ├── remote: RemoteConfig          # endpoint, bucket, prefix, region
//! ├── settings: JournalSettings
//! │   ├── packer: PackerConfig      # change-feed batch + pack flush thresholds
//! │   └── transfer: TransferConfig  # cancel cap, idle wait, retry backoff
//! └── storage: StorageConfig        # SQLite checkpoint/queue database
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! remote:
//!   endpoint: "https://s3.eu-west-2.amazonaws.com"
//!   bucket: "vault-journal"
//!   prefix: "laptop/"
//!   region: "eu-west-2"
//!
//! settings:
//!   packer:
//!     batch_size: 100
//!     max_pack_records: 250
//!   transfer:
//!     max_cancel_count: 3
//!     idle_wait: "3s"
//!     retry_backoff: "1s"
//!
//! storage:
//!   sqlite_path: "/var/lib/app/journal.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Change-feed entries read per packer iteration.
pub const DEFAULT_CHANGES_BATCH_SIZE: usize = 100;

/// A pack is flushed once its buffer holds more records than this.
pub const MAX_PACK_RECORDS: usize = 250;

/// A pack is flushed once its uncompressed buffer grows past this many bytes.
pub const MAX_PACK_BYTES: usize = 10 * 1024 * 1024;

/// A queue entry dequeued with a higher cancel count aborts its pump.
pub const MAX_CANCEL_COUNT: u32 = 3;

/// How long an idle pump waits for the wake notifier before polling again.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_secs(3);

/// Pause after a failed upload/apply before the entry is retried.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `JournalSync::open()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalSyncConfig {
    /// Which bucket (and where in it) this replica exchanges packs through.
    pub remote: RemoteConfig,

    /// Packing and transfer tuning.
    #[serde(default)]
    pub settings: JournalSettings,

    /// Checkpoint and queue persistence.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for JournalSyncConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            settings: JournalSettings::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl JournalSyncConfig {
    /// Create a minimal config for testing: in-memory SQLite, millisecond waits.
    pub fn for_testing(bucket: &str) -> Self {
        Self {
            remote: RemoteConfig::for_testing(bucket),
            settings: JournalSettings {
                packer: PackerConfig::default(),
                transfer: TransferConfig::testing(),
            },
            storage: StorageConfig::in_memory(),
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.remote.bucket.trim().is_empty() {
            return Err(crate::error::JournalError::Config(
                "remote.bucket must not be empty".to_string(),
            ));
        }
        if self.settings.packer.batch_size == 0 {
            return Err(crate::error::JournalError::Config(
                "settings.packer.batch_size must be at least 1".to_string(),
            ));
        }
        if self.storage.sqlite_path.trim().is_empty() {
            return Err(crate::error::JournalError::Config(
                "storage.sqlite_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RemoteConfig: identifies the bucket lineage
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote bucket identity.
///
/// The four location fields also key the checkpoint, so changing any of them
/// starts a fresh checkpoint lineage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Object store endpoint URL.
    #[serde(default)]
    pub endpoint: String,

    /// Bucket name.
    pub bucket: String,

    /// Key prefix inside the bucket (may be empty).
    #[serde(default)]
    pub prefix: String,

    /// Region name (may be empty for providers without regions).
    #[serde(default)]
    pub region: String,

    /// If set, the negotiation document's salt must match this value.
    #[serde(default)]
    pub expected_salt: Option<String>,
}

impl RemoteConfig {
    /// Create a remote config for testing.
    pub fn for_testing(bucket: &str) -> Self {
        Self {
            endpoint: "memory://".to_string(),
            bucket: bucket.to_string(),
            prefix: String::new(),
            region: String::new(),
            expected_salt: None,
        }
    }

    /// Persistence key of the checkpoint for this remote.
    pub fn checkpoint_key(&self) -> String {
        crate::checkpoint::checkpoint_key(&self.endpoint, &self.bucket, &self.prefix, &self.region)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JournalSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable parameters for the two pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JournalSettings {
    #[serde(default)]
    pub packer: PackerConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Packer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Change-feed entries read per iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush once the buffer holds more records than this.
    #[serde(default = "default_max_pack_records")]
    pub max_pack_records: usize,

    /// Flush once the uncompressed buffer is larger than this.
    #[serde(default = "default_max_pack_bytes")]
    pub max_pack_bytes: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_CHANGES_BATCH_SIZE
}

fn default_max_pack_records() -> usize {
    MAX_PACK_RECORDS
}

fn default_max_pack_bytes() -> usize {
    MAX_PACK_BYTES
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_CHANGES_BATCH_SIZE,
            max_pack_records: MAX_PACK_RECORDS,
            max_pack_bytes: MAX_PACK_BYTES,
        }
    }
}

/// Upload/download pump configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Entries dequeued with a higher cancel count abort the pump.
    #[serde(default = "default_max_cancel_count")]
    pub max_cancel_count: u32,

    /// Bounded wait on the wake notifier when the lane is empty
    /// but its producer is still running (e.g., "3s").
    #[serde(default = "default_idle_wait")]
    pub idle_wait: String,

    /// Pause after a failed attempt before retrying (e.g., "1s").
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: String,
}

fn default_max_cancel_count() -> u32 {
    MAX_CANCEL_COUNT
}

fn default_idle_wait() -> String {
    "3s".to_string()
}

fn default_retry_backoff() -> String {
    "1s".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_cancel_count: MAX_CANCEL_COUNT,
            idle_wait: default_idle_wait(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl TransferConfig {
    /// Millisecond waits so tests don't sleep for seconds.
    pub fn testing() -> Self {
        Self {
            max_cancel_count: MAX_CANCEL_COUNT,
            idle_wait: "20ms".to_string(),
            retry_backoff: "5ms".to_string(),
        }
    }

    /// Parse `idle_wait`, falling back to [`DEFAULT_IDLE_WAIT`].
    pub fn idle_wait_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_wait).unwrap_or(DEFAULT_IDLE_WAIT)
    }

    /// Parse `retry_backoff`, falling back to [`DEFAULT_RETRY_BACKOFF`].
    pub fn retry_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_backoff).unwrap_or(DEFAULT_RETRY_BACKOFF)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint and queue persistence configuration.
///
/// Both live in one SQLite database so a restart sees consistent
/// checkpoint and lane contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database, or `:memory:`.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "journal_sync.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StorageConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: crate::db::MEMORY_PATH.to_string(),
            wal_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packer_defaults_use_named_constants() {
        let config = PackerConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_pack_records, 250);
        assert_eq!(config.max_pack_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_transfer_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.max_cancel_count, 3);
        assert_eq!(config.idle_wait_duration(), Duration::from_secs(3));
        assert_eq!(config.retry_backoff_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_transfer_duration_formats() {
        let cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("250ms", Duration::from_millis(250)),
        ];
        for (input, expected) in cases {
            let config = TransferConfig {
                idle_wait: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.idle_wait_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_transfer_invalid_duration_falls_back() {
        let config = TransferConfig {
            idle_wait: "soon".to_string(),
            retry_backoff: "later".to_string(),
            ..Default::default()
        };
        assert_eq!(config.idle_wait_duration(), DEFAULT_IDLE_WAIT);
        assert_eq!(config.retry_backoff_duration(), DEFAULT_RETRY_BACKOFF);
    }

    #[test]
    fn test_for_testing_config() {
        let config = JournalSyncConfig::for_testing("bucket-a");
        assert_eq!(config.remote.bucket, "bucket-a");
        assert_eq!(config.storage.sqlite_path, ":memory:");
        assert!(config.settings.transfer.idle_wait_duration() < Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_bucket() {
        let config = JournalSyncConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = JournalSyncConfig::for_testing("b");
        config.settings.packer.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checkpoint_key_follows_remote() {
        let a = RemoteConfig::for_testing("a");
        let b = RemoteConfig::for_testing("b");
        assert_ne!(a.checkpoint_key(), b.checkpoint_key());
        assert_eq!(a.checkpoint_key(), RemoteConfig::for_testing("a").checkpoint_key());
    }

    #[test]
    fn test_config_yaml_like_json_defaults() {
        let json = r#"{ "remote": { "bucket": "vault" } }"#;
        let parsed: JournalSyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.remote.bucket, "vault");
        assert_eq!(parsed.remote.prefix, "");
        assert_eq!(parsed.settings.packer.max_pack_records, MAX_PACK_RECORDS);
        assert_eq!(parsed.settings.transfer.max_cancel_count, MAX_CANCEL_COUNT);
        assert_eq!(parsed.storage.sqlite_path, "journal_sync.db");
        assert!(parsed.storage.wal_mode);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = JournalSyncConfig::for_testing("roundtrip");
        config.remote.prefix = "laptop/".to_string();
        config.settings.packer.max_pack_records = 10;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: JournalSyncConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.remote.prefix, "laptop/");
        assert_eq!(parsed.settings.packer.max_pack_records, 10);
        assert_eq!(parsed.settings.transfer.idle_wait, "20ms");
    }
}
