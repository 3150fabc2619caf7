// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Journal Sync
//!
//! Replicates a revision-tracked document store between disconnected
//! replicas through an object-storage bucket. Replicas never talk to each
//! other: each one uploads compressed "journal packs" of its local changes
//! and merges the packs the others left behind.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              journal-sync                                │
//! │                                                                          │
//! │  ┌────────────┐   ┌─────────┐   ┌─────────────┐   ┌──────────────────┐   │
//! │  │ LocalStore │──►│ Packer  │──►│ upload lane │──►│ Uploader         │──►│── bucket
//! │  │ (changes)  │   │ (gzip)  │   │ (SQLite)    │   │ (sentFiles)      │   │
//! │  └────────────┘   └─────────┘   └─────────────┘   └──────────────────┘   │
//! │        ▲                                                                 │
//! │        │          ┌─────────┐   ┌─────────────┐   ┌──────────────────┐   │
//! │        └──────────│ Applier │◄──│ parse lane  │◄──│ Downloader       │◄──│── bucket
//! │                   │ (merge) │   │ (SQLite)    │   │ (receivedFiles)  │   │
//! │                   └─────────┘   └─────────────┘   └──────────────────┘   │
//! │                                                                          │
//! │                 CheckpointStore (SQLite): progress + dedup sets          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once delivery** through durable lanes with commit/cancel.
//! - **Idempotent apply**: chunks are content-addressed, documents merge by
//!   revision diff, so a redelivered pack changes nothing.
//! - **Crash recovery**: lanes and checkpoint live in SQLite; a crash at any
//!   point resumes from the last durable step.
//! - **Bounded retry**: a pack cancelled more than three times fails the run
//!   instead of spinning.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use journal_sync::{FsObjectStore, JournalSync, JournalSyncConfig, MemoryLocalStore, RemoteConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = JournalSyncConfig {
//!         remote: RemoteConfig {
//!             endpoint: "file:///mnt/shared".to_string(),
//!             bucket: "vault".to_string(),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!     let local = Arc::new(MemoryLocalStore::new());
//!     let remote = Arc::new(FsObjectStore::new("/mnt/shared/vault"));
//!
//!     let engine = JournalSync::open_without_hooks(config, local, remote)
//!         .await
//!         .expect("Failed to open");
//!
//!     if engine.sync().await {
//!         println!("checkpoint: {:?}", engine.checkpoint().await.last_local_seq);
//!     }
//!     engine.close().await.expect("Failed to close");
//! }
//! ```

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod document;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod object_store;
pub mod protocol;
pub mod queue;
pub mod singleflight;
pub mod store;

// Re-exports for convenience
pub use checkpoint::{CheckpointInfo, CheckpointStore};
pub use config::{JournalSettings, JournalSyncConfig, PackerConfig, RemoteConfig, StorageConfig, TransferConfig};
pub use coordinator::{JournalSync, ReceiveReport, SendReport, SharedResult, SyncReport, SyncStatus};
pub use document::{ChunkDoc, Document, RegularDoc};
pub use error::{JournalError, Result};
pub use hooks::{NoOpHooks, ReplicationHooks};
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStoreError, ObjectStoreProvider};
pub use queue::{DurableQueue, QueueEntry, SqliteQueue};
pub use store::{LocalStore, MemoryLocalStore, StoreError};
