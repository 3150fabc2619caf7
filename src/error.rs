// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for journal sync.
//!
//! Errors are categorized by where they come from (object store, SQLite,
//! the local document store, pack payloads) and carry enough context to
//! tell a transient outage from corrupt data.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Upload, download or listing failed |
//! | `Unavailable` | Yes | Bucket unreachable during pre-flight |
//! | `LocalStore` | Yes | Local document store temporarily failed |
//! | `Storage` | No | Checkpoint/queue SQLite errors (needs operator attention) |
//! | `Serialization` | No | Checkpoint or protocol JSON could not be (de)serialized |
//! | `Protocol` | No | Negotiation document unreadable or incompatible |
//! | `Decompression` | No | Pack payload is not valid gzip |
//! | `Decode` | No | Malformed record inside a pack |
//! | `RetryExhausted` | No | A queue entry hit the cancel cap |
//! | `InvalidState` | No | Invariant violation (e.g. releasing an entry never dequeued) |
//! | `Stopped` | No | A stop was requested; the run ended early |
//! | `Config` | No | Configuration invalid |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Pipelines turn most errors into a commit/cancel decision on the queue
//! entry they were processing. [`JournalError::is_retryable()`] tells callers
//! whether calling `sync` again later is likely to help.

use thiserror::Error;

/// Result type alias for journal sync operations.
pub type Result<T> = std::result::Result<T, JournalError>;

/// Errors that can occur while exchanging journal packs.
#[derive(Error, Debug)]
pub enum JournalError {
    /// Object store transport failure.
    ///
    /// Covers thrown errors and `false`/empty results alike; the engine
    /// treats both the same for retry purposes.
    #[error("Transport error ({operation}): {message}")]
    Transport { operation: String, message: String },

    /// The bucket did not answer the availability probe.
    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    /// SQLite error while persisting checkpoints or queue lanes.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON (de)serialization of persisted state failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Negotiation document missing fields, unparseable or incompatible.
    #[error("Protocol negotiation failed: {0}")]
    Protocol(String),

    /// Gzip decompression failure.
    ///
    /// The pack is truncated or corrupt at the source.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// A record inside a pack could not be parsed.
    #[error("Record decode error: {0}")]
    Decode(String),

    /// The local document store rejected a call.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// A queue entry was cancelled more often than the retry budget allows.
    #[error("Retry budget exhausted on lane {lane} (entry {key}, cancelled {cancel_count} times)")]
    RetryExhausted {
        lane: String,
        key: i64,
        cancel_count: u32,
    },

    /// Invariant violation.
    ///
    /// Indicates a bug in the caller, never swallowed.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The run ended early because a stop was requested.
    #[error("Sync stopped")]
    Stopped,

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JournalError {
    /// Create a transport error for an object store operation.
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Unavailable(_) => true,
            Self::LocalStore(_) => true,
            Self::Storage(_) => false,
            Self::Serialization(_) => false,
            Self::Protocol(_) => false,
            Self::Decompression(_) => false,
            Self::Decode(_) => false,
            Self::RetryExhausted { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Stopped => false,
            Self::Config(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Unavailable(_) => "unavailable",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Protocol(_) => "protocol",
            Self::Decompression(_) => "decompression",
            Self::Decode(_) => "decode",
            Self::LocalStore(_) => "local_store",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::InvalidState { .. } => "invalid_state",
            Self::Stopped => "stopped",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<crate::store::StoreError> for JournalError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::LocalStore(e.0)
    }
}
