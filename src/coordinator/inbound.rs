// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound pipeline: downloader and applier.
//!
//! The downloader lists packs newer than the last consumed one, skips files
//! this replica uploaded itself, and moves the rest onto the parse lane.
//! The applier drains the lane, decodes each pack and merges it:
//!
//! - chunks are inserted only when missing (content-addressed, never
//!   overwritten)
//! - documents are inserted only for revisions the local store lacks,
//!   with their remote history intact
//!
//! Applying the same pack twice changes nothing the second time, so the
//! lane's at-least-once delivery is safe.

use super::types::ApplyReport;
use super::Pipeline;
use crate::codec::{decode_records, decompress_pack};
use crate::document::{ChunkDoc, Document, RegularDoc};
use crate::error::{JournalError, Result};
use crate::hooks::ReplicationHooks;
use crate::metrics;
use crate::object_store::{compare_pack_names, is_pack_name, ObjectStoreProvider};
use crate::store::LocalStore;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Files handled by one listing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DownloadOutcome {
    pub downloaded: usize,
    pub skipped_own: usize,
}

/// List unseen remote packs and move them onto the parse lane.
///
/// A failed download aborts the pass; the file is not recorded as received,
/// so the next run lists it again.
pub(crate) async fn download_remote_packs<L, O, H>(pipeline: &Pipeline<L, O, H>) -> Result<DownloadOutcome>
where
    L: LocalStore,
    O: ObjectStoreProvider,
    H: ReplicationHooks,
{
    let span = info_span!("download", lane = %pipeline.parse_lane.lane());

    async move {
        let checkpoint = pipeline.checkpoint.get().await;
        let after = checkpoint.latest_received_file().map(str::to_string);

        let listed = pipeline
            .remote
            .list(after.as_deref(), None)
            .await
            .map_err(|e| JournalError::transport("list", e.0))?;

        let mut names: Vec<String> = listed
            .into_iter()
            .filter(|name| is_pack_name(name))
            .filter(|name| !checkpoint.received_files.contains(name))
            .collect();
        names.sort_by(|a, b| compare_pack_names(a, b));

        if names.is_empty() {
            debug!(after = ?after, "No new remote packs");
            return Ok(DownloadOutcome::default());
        }
        info!(count = names.len(), after = ?after, "Found new remote packs");

        let mut outcome = DownloadOutcome::default();
        for name in names {
            if pipeline.is_stopped() {
                return Err(JournalError::Stopped);
            }

            if pipeline.checkpoint.get().await.sent_files.contains(&name) {
                debug!(file = %name, "Skipping own upload");
                let received = name.clone();
                pipeline.checkpoint.update(|c| c.with_received_file(received)).await?;
                metrics::record_self_sent_skip();
                outcome.skipped_own += 1;
                continue;
            }

            let data = match pipeline.remote.download(&name).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    metrics::record_download(false, 0);
                    return Err(JournalError::transport("download", format!("{} vanished", name)));
                }
                Err(e) => {
                    metrics::record_download(false, 0);
                    warn!(file = %name, error = %e, "Download failed, aborting pass");
                    return Err(JournalError::transport("download", e.0));
                }
            };
            let bytes = data.len();

            pipeline.parse_lane.enqueue(data).await?;
            let received = name.clone();
            pipeline.checkpoint.update(|c| c.with_received_file(received)).await?;
            pipeline.parse_wake.notify_one();

            metrics::record_download(true, bytes);
            debug!(file = %name, bytes, "Downloaded pack onto parse lane");
            outcome.downloaded += 1;
        }

        Ok(outcome)
    }
    .instrument(span)
    .await
}

/// Drain the parse lane into the local store.
///
/// While `downloading` is set an empty lane means "wait for the
/// downloader". Returns the number of packs applied.
pub(crate) async fn run_applier<L, O, H>(pipeline: &Pipeline<L, O, H>, downloading: &AtomicBool) -> Result<usize>
where
    L: LocalStore,
    O: ObjectStoreProvider,
    H: ReplicationHooks,
{
    let span = info_span!("apply", lane = %pipeline.parse_lane.lane());

    async move {
        let max_cancel_count = pipeline.settings.transfer.max_cancel_count;
        let mut applied = 0;

        // runs are single-flighted, so any lease still held is orphaned
        pipeline.parse_lane.release_leases().await?;

        loop {
            if pipeline.is_stopped() {
                return Err(JournalError::Stopped);
            }

            let Some(entry) = pipeline.parse_lane.dequeue_with_commit().await? else {
                if downloading.load(Ordering::SeqCst) {
                    pipeline.idle(&pipeline.parse_wake).await;
                    continue;
                }
                debug!(applied, "Parse lane drained");
                return Ok(applied);
            };

            if entry.cancel_count > max_cancel_count {
                error!(
                    key = entry.key,
                    cancel_count = entry.cancel_count,
                    "Apply retry budget exhausted"
                );
                pipeline.parse_lane.cancel(entry.key).await?;
                metrics::record_retry_exhausted(pipeline.parse_lane.lane());
                return Err(JournalError::RetryExhausted {
                    lane: pipeline.parse_lane.lane().to_string(),
                    key: entry.key,
                    cancel_count: entry.cancel_count,
                });
            }

            match apply_pack(pipeline, &entry.value).await {
                Ok(report) => {
                    if let Err(e) = pipeline.parse_lane.commit(entry.key).await {
                        error!(key = entry.key, error = %e, "Could not commit applied pack");
                        if let Err(cancel_err) = pipeline.parse_lane.cancel(entry.key).await {
                            warn!(key = entry.key, error = %cancel_err, "Could not return pack to lane");
                        }
                        return Err(e);
                    }
                    applied += 1;
                    debug!(
                        key = entry.key,
                        inserted = report.inserted(),
                        pending = entry.pending_items,
                        "Applied pack"
                    );
                }
                Err(e) => {
                    warn!(
                        key = entry.key,
                        error = %e,
                        cancel_count = entry.cancel_count,
                        "Apply failed, returning pack to lane"
                    );
                    metrics::record_error(e.kind());
                    pipeline.parse_lane.cancel(entry.key).await?;
                    pipeline.backoff().await;
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Decompress, decode and merge one pack.
pub(crate) async fn apply_pack<L, O, H>(pipeline: &Pipeline<L, O, H>, data: &[u8]) -> Result<ApplyReport>
where
    L: LocalStore,
    O: ObjectStoreProvider,
    H: ReplicationHooks,
{
    let payload = decompress_pack(data)?;
    if payload.is_empty() {
        debug!("Empty pack, nothing to apply");
        return Ok(ApplyReport::default());
    }
    let docs = decode_records(&payload)?;
    process_documents(pipeline, docs).await
}

/// Merge a decoded batch into the local store.
///
/// Per-item insert failures are logged and left out of the hooks and of
/// `knownIDs`; only failures of the batch lookups abort the call.
pub(crate) async fn process_documents<L, O, H>(pipeline: &Pipeline<L, O, H>, docs: Vec<Document>) -> Result<ApplyReport>
where
    L: LocalStore,
    O: ObjectStoreProvider,
    H: ReplicationHooks,
{
    let mut chunks: Vec<ChunkDoc> = Vec::new();
    let mut regular: Vec<RegularDoc> = Vec::new();
    for doc in docs {
        match doc {
            Document::Chunk(chunk) => chunks.push(chunk),
            Document::Regular(doc) => regular.push(doc),
        }
    }

    let mut report = ApplyReport::default();
    let mut known: Vec<String> = Vec::new();

    if !chunks.is_empty() {
        let ids = chunks.iter().map(|c| c.id.clone()).collect();
        let existing = pipeline.local.existing_chunk_ids(ids).await?;

        let total = chunks.len();
        let mut seen = HashSet::new();
        let missing: Vec<ChunkDoc> = chunks
            .into_iter()
            .filter(|c| !existing.contains(&c.id) && seen.insert(c.id.clone()))
            .collect();
        report.chunks_skipped = total - missing.len();

        let results = join_all(missing.iter().cloned().map(|chunk| pipeline.local.insert_chunk(chunk))).await;

        let mut arrived = Vec::with_capacity(missing.len());
        for (chunk, result) in missing.into_iter().zip(results) {
            match result {
                Ok(()) => arrived.push(chunk),
                Err(e) => {
                    warn!(chunk = %chunk.id, error = %e, "Chunk insert failed, skipping");
                    report.chunks_failed += 1;
                }
            }
        }

        report.chunks_inserted = arrived.len();
        if !arrived.is_empty() {
            pipeline.hooks.on_chunk_arrived(&arrived);
            known.extend(arrived.into_iter().map(|c| c.id));
        }
    }

    if !regular.is_empty() {
        let pairs = regular.iter().map(|d| (d.id.clone(), d.revision.clone())).collect();
        let missing: HashSet<(String, String)> = pipeline.local.revs_diff(pairs).await?.into_iter().collect();

        let total = regular.len();
        let mut seen = HashSet::new();
        let to_apply: Vec<RegularDoc> = regular
            .into_iter()
            .filter(|d| missing.contains(&(d.id.clone(), d.revision.clone())) && seen.insert(d.dockey()))
            .collect();
        report.docs_skipped = total - to_apply.len();

        if !to_apply.is_empty() {
            let results = pipeline.local.bulk_insert_replicated(to_apply.clone()).await?;

            let mut written = HashSet::new();
            for result in results {
                match &result.error {
                    None => {
                        written.insert(result.dockey());
                    }
                    Some(e) => {
                        warn!(doc = %result.id, rev = %result.revision, error = %e, "Document insert failed, skipping");
                        report.docs_failed += 1;
                    }
                }
            }

            let applied: Vec<RegularDoc> = to_apply.into_iter().filter(|d| written.contains(&d.dockey())).collect();
            report.docs_inserted = applied.len();
            if !applied.is_empty() {
                pipeline.hooks.on_replication_result(&applied);
                known.extend(applied.iter().map(RegularDoc::dockey));
            }
        }
    }

    if !known.is_empty() {
        pipeline.checkpoint.update(|c| c.with_known_ids(known)).await?;
    }

    metrics::record_chunks_applied(report.chunks_inserted, report.chunks_skipped, report.chunks_failed);
    metrics::record_documents_applied(report.docs_inserted, report.docs_skipped, report.docs_failed);
    Ok(report)
}
