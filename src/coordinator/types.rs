// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync status and run reports.
//!
//! # Status Transitions
//!
//! ```text
//!                 sync()
//!   Idle ─────────────────→ Receiving ──(receive failed)──→ Failed
//!    ↑                          │
//!    │ resume()                 │ (receive ok)
//!    │                          ↓
//! Stopped ←──(stop flag)──── Sending ──(send failed)──→ Failed
//!                               │
//!                               ↓
//!                           Completed
//! ```
//!
//! `Failed`, `Completed` and `Stopped` are resting states; the next call to
//! `sync()` starts over at `Receiving`.

/// Status of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No run has happened yet, or the engine was reset or resumed.
    Idle,

    /// Listing, downloading and applying remote packs.
    Receiving,

    /// Packing and uploading local changes.
    Sending,

    /// The last run finished both directions.
    Completed,

    /// The last run failed. Check logs for error details.
    Failed,

    /// A stop was requested. Call `resume()` before syncing again.
    Stopped,
}

impl SyncStatus {
    /// Lowercase label for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Receiving => "receiving",
            SyncStatus::Sending => "sending",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Stopped => "stopped",
        }
    }

    /// Whether a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Receiving | SyncStatus::Sending)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "Idle"),
            SyncStatus::Receiving => write!(f, "Receiving"),
            SyncStatus::Sending => write!(f, "Sending"),
            SyncStatus::Completed => write!(f, "Completed"),
            SyncStatus::Failed => write!(f, "Failed"),
            SyncStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Outcome of a receive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Remote packs downloaded onto the parse lane.
    pub downloaded: usize,
    /// Listed packs recognised as this replica's own uploads.
    pub skipped_own: usize,
    /// Packs taken off the parse lane and applied.
    pub applied_packs: usize,
}

/// Outcome of a send pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Packs flushed onto the upload lane.
    pub packed: usize,
    /// Packs uploaded to the bucket.
    pub uploaded: usize,
}

/// Outcome of a full `sync()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub received: ReceiveReport,
    pub sent: SendReport,
}

/// Per-pack apply accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub chunks_inserted: usize,
    pub chunks_skipped: usize,
    pub chunks_failed: usize,
    pub docs_inserted: usize,
    pub docs_skipped: usize,
    pub docs_failed: usize,
}

impl ApplyReport {
    /// Records that changed the local store.
    pub fn inserted(&self) -> usize {
        self.chunks_inserted + self.docs_inserted
    }
}
