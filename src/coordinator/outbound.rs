// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound pipeline: packer and uploader.
//!
//! Two cooperative loops coupled only through the upload lane and the
//! checkpoint:
//!
//! ```text
//! change feed ──► packer ──(gzip pack)──► upload lane ──► uploader ──► bucket
//!                   │                         ▲              │
//!                   └── lastLocalSeq, sentIDs │  sentFiles ──┘
//!                                             └── wake ──────┘
//! ```
//!
//! # Delivery
//!
//! `sentIDs` and `lastLocalSeq` move when a pack is durably enqueued, before
//! the upload is confirmed. A crash between enqueue and upload loses
//! nothing: the pack is still on the lane. A crash while the buffer holds
//! unflushed records re-scans only that tail on the next run.

use super::Pipeline;
use crate::checkpoint::CheckpointInfo;
use crate::codec::PackBuffer;
use crate::error::{JournalError, Result};
use crate::metrics;
use crate::object_store::{pack_name, parse_pack_timestamp, ObjectStoreProvider, PACK_MIME};
use crate::hooks::ReplicationHooks;
use crate::store::{ChangeEntry, LocalStore};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Issues unique, increasing pack names.
///
/// A stamp is `max(now, last issued + 1, newest seen + 1)`, where "seen"
/// covers every file this replica uploaded or consumed.
#[derive(Debug, Default)]
pub(crate) struct PackNamer {
    last_issued: AtomicU64,
}

impl PackNamer {
    pub(crate) fn next(&self, checkpoint: &CheckpointInfo, now_ms: u64) -> String {
        let newest_seen = checkpoint
            .sent_files
            .iter()
            .chain(checkpoint.received_files.iter())
            .filter_map(|name| parse_pack_timestamp(name))
            .max();
        let floor = now_ms.max(newest_seen.map_or(0, |t| t.saturating_add(1)));

        let previous = self
            .last_issued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(floor.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        pack_name(floor.max(previous.saturating_add(1)))
    }

    pub(crate) fn reset(&self) {
        self.last_issued.store(0, Ordering::SeqCst);
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Keep only the parts of a feed entry that still need packing.
fn unsent_part(mut entry: ChangeEntry, checkpoint: &CheckpointInfo, buffer: &PackBuffer) -> Option<ChangeEntry> {
    let pending = |dockey: &str| !checkpoint.is_known_or_sent(dockey) && !buffer.contains(dockey);

    if entry.is_chunk() {
        return pending(&entry.id).then_some(entry);
    }
    let id = entry.id.clone();
    entry
        .revs
        .retain(|rev| pending(&crate::document::revision_dockey(&id, rev)));
    (!entry.revs.is_empty()).then_some(entry)
}

/// Turn unsent local changes into packs on the upload lane.
///
/// Returns the number of packs flushed.
pub(crate) async fn pack_local_changes<L, O, H>(pipeline: &Pipeline<L, O, H>) -> Result<usize>
where
    L: LocalStore,
    O: ObjectStoreProvider,
    H: ReplicationHooks,
{
    let span = info_span!("pack", lane = %pipeline.upload_lane.lane());

    async move {
        let packer = &pipeline.settings.packer;
        let head = pipeline.local.update_seq().await?;
        let mut since = pipeline.checkpoint.get().await.last_local_seq;

        if since >= head {
            debug!(since, head, "No local changes to pack");
            return Ok(0);
        }
        info!(since, head, "Packing local changes");

        let mut buffer = PackBuffer::new();
        let mut flushed = 0;

        loop {
            if pipeline.is_stopped() {
                debug!(since, "Stop requested, leaving unflushed tail for the next run");
                return Err(JournalError::Stopped);
            }

            let batch = pipeline.local.changes_since(since, packer.batch_size).await?;
            if batch.results.is_empty() {
                break;
            }

            let checkpoint = pipeline.checkpoint.get().await;
            let candidates: Vec<ChangeEntry> = batch
                .results
                .into_iter()
                .filter_map(|entry| unsent_part(entry, &checkpoint, &buffer))
                .collect();

            let docs = if candidates.is_empty() {
                Vec::new()
            } else {
                pipeline.local.bulk_get(candidates).await?
            };

            for doc in docs {
                let dockey = doc.dockey();
                // bulk_get may hand back several revisions per entry
                if checkpoint.is_known_or_sent(&dockey) || buffer.contains(&dockey) {
                    trace!(dockey = %dockey, "Already sent or known");
                    continue;
                }
                buffer.push(&doc)?;

                if buffer.exceeds(packer.max_pack_records, packer.max_pack_bytes) {
                    // everything before this feed batch is now in the pack
                    flush_pack(pipeline, &mut buffer, since).await?;
                    flushed += 1;
                }
            }

            since = batch.last_seq;
            if buffer.is_empty() {
                pipeline
                    .checkpoint
                    .update(|c| c.advance_local_seq(since))
                    .await?;
            }
            if since >= head {
                break;
            }
        }

        if !buffer.is_empty() {
            flush_pack(pipeline, &mut buffer, since).await?;
            flushed += 1;
        }

        info!(packs = flushed, last_local_seq = since, "Packing finished");
        Ok(flushed)
    }
    .instrument(span)
    .await
}

/// Compress the buffer onto the upload lane and record what it holds.
async fn flush_pack<L, O, H>(pipeline: &Pipeline<L, O, H>, buffer: &mut PackBuffer, durable_seq: u64) -> Result<()>
where
    L: LocalStore,
    O: ObjectStoreProvider,
    H: ReplicationHooks,
{
    let records = buffer.len();
    let raw_bytes = buffer.bytes();
    let (compressed, dockeys) = buffer.take_compressed()?;
    let compressed_bytes = compressed.len();

    pipeline.upload_lane.enqueue(compressed).await?;
    pipeline
        .checkpoint
        .update(|c| c.with_sent_ids(dockeys).advance_local_seq(durable_seq))
        .await?;
    pipeline.upload_wake.notify_one();

    metrics::record_pack_flush(records, compressed_bytes);
    info!(records, raw_bytes, compressed_bytes, "Flushed pack onto upload lane");
    Ok(())
}

/// Drain the upload lane into the bucket.
///
/// While `packing` is set an empty lane means "wait for the packer";
/// otherwise it means done. Returns the number of packs uploaded.
pub(crate) async fn run_uploader<L, O, H>(pipeline: &Pipeline<L, O, H>, packing: &AtomicBool) -> Result<usize>
where
    L: LocalStore,
    O: ObjectStoreProvider,
    H: ReplicationHooks,
{
    let span = info_span!("upload", lane = %pipeline.upload_lane.lane());

    async move {
        let transfer = &pipeline.settings.transfer;
        let mut uploaded = 0;

        // runs are single-flighted, so any lease still held is orphaned
        pipeline.upload_lane.release_leases().await?;

        loop {
            if pipeline.is_stopped() {
                return Err(JournalError::Stopped);
            }

            let Some(entry) = pipeline.upload_lane.dequeue_with_commit().await? else {
                if packing.load(Ordering::SeqCst) {
                    pipeline.idle(&pipeline.upload_wake).await;
                    continue;
                }
                debug!(uploaded, "Upload lane drained");
                return Ok(uploaded);
            };

            if entry.cancel_count > transfer.max_cancel_count {
                error!(
                    key = entry.key,
                    cancel_count = entry.cancel_count,
                    "Upload retry budget exhausted"
                );
                pipeline.upload_lane.cancel(entry.key).await?;
                metrics::record_retry_exhausted(pipeline.upload_lane.lane());
                return Err(JournalError::RetryExhausted {
                    lane: pipeline.upload_lane.lane().to_string(),
                    key: entry.key,
                    cancel_count: entry.cancel_count,
                });
            }

            let name = pipeline.namer.next(&pipeline.checkpoint.get().await, now_ms());
            let bytes = entry.value.len();

            let outcome = match pipeline.remote.upload(&name, entry.value, PACK_MIME).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(JournalError::transport("upload", "provider rejected upload")),
                Err(e) => Err(JournalError::transport("upload", e.0)),
            };

            match outcome {
                Ok(()) => {
                    let sent = name.clone();
                    let settled: Result<()> = async {
                        pipeline.checkpoint.update(|c| c.with_sent_file(sent)).await?;
                        pipeline.upload_lane.commit(entry.key).await
                    }
                    .await;
                    if let Err(e) = settled {
                        error!(file = %name, error = %e, "Could not settle uploaded pack");
                        if let Err(cancel_err) = pipeline.upload_lane.cancel(entry.key).await {
                            warn!(key = entry.key, error = %cancel_err, "Could not return pack to lane");
                        }
                        return Err(e);
                    }
                    uploaded += 1;
                    pipeline.upload_wake.notify_one();
                    metrics::record_upload(true, bytes);
                    debug!(file = %name, bytes, pending = entry.pending_items, "Uploaded pack");
                }
                Err(e) => {
                    warn!(
                        file = %name,
                        error = %e,
                        cancel_count = entry.cancel_count,
                        "Upload failed, returning pack to lane"
                    );
                    metrics::record_upload(false, 0);
                    pipeline.upload_lane.cancel(entry.key).await?;
                    pipeline.backoff().await;
                }
            }
        }
    }
    .instrument(span)
    .await
}
