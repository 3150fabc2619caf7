// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Callbacks into the surrounding application.
//!
//! The applier calls these synchronously, once per applied batch, after the
//! local store accepted the writes. Implementations must return quickly;
//! anything slow belongs on the application's own task.

use crate::document::{ChunkDoc, RegularDoc};

/// Notifications emitted while applying inbound packs.
pub trait ReplicationHooks: Send + Sync + 'static {
    /// Chunks newly inserted from a pack (already-present chunks excluded).
    fn on_chunk_arrived(&self, _chunks: &[ChunkDoc]) {}

    /// Document revisions written from a pack, with their remote history.
    fn on_replication_result(&self, _docs: &[RegularDoc]) {}
}

/// Hooks that ignore every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHooks;

impl ReplicationHooks for NoOpHooks {}
