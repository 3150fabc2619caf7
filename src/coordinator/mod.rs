// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Journal sync coordinator.
//!
//! The orchestrator that ties together:
//! - The local document store via [`crate::store::LocalStore`]
//! - The bucket via [`crate::object_store::ObjectStoreProvider`]
//! - Checkpoint persistence via [`crate::checkpoint::CheckpointStore`]
//! - The upload and parse lanes via [`crate::queue::DurableQueue`]
//!
//! # Architecture
//!
//! ```text
//! sync()
//!   ├─ pre-flight: availability probe, protocol negotiation
//!   ├─ receive:  join!(downloader, applier) + wrap-up apply pass
//!   └─ send:     join!(packer, uploader)    + wrap-up upload pass
//! ```
//!
//! Send never runs when receive failed, so nothing is uploaded against a
//! possibly stale merge base. The pumps of one direction are interleaved on
//! the caller's task; nothing is spawned.
//!
//! # Single-Flight
//!
//! `sync`, the receive phase, the packing step and the upload step are
//! keyed single-flights: concurrent triggers share the execution already
//! running instead of racing on the same lanes. `reset()` waits for every
//! in-flight run. A run dropped by its caller leaves leases behind; the
//! next pump on that lane releases them before draining.

mod inbound;
mod outbound;
mod types;

pub use types::{ApplyReport, ReceiveReport, SendReport, SyncReport, SyncStatus};

use crate::checkpoint::{CheckpointInfo, CheckpointStore};
use crate::config::{JournalSettings, JournalSyncConfig};
use crate::db;
use crate::error::{JournalError, Result};
use crate::hooks::{NoOpHooks, ReplicationHooks};
use crate::metrics;
use crate::object_store::ObjectStoreProvider;
use crate::protocol::{negotiate, ProtocolDocument};
use crate::queue::{lane_name, DurableQueue, SqliteQueue, PARSE_LANE_SUFFIX, UPLOAD_LANE_SUFFIX};
use crate::singleflight::SingleFlight;
use crate::store::LocalStore;
use outbound::PackNamer;
use sqlx::sqlite::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

/// Result shared between single-flight callers.
pub type SharedResult<T> = std::result::Result<T, Arc<JournalError>>;

/// Everything the four pumps share.
pub(crate) struct Pipeline<L, O, H> {
    pub(crate) local: Arc<L>,
    pub(crate) remote: Arc<O>,
    pub(crate) hooks: Arc<H>,
    pub(crate) checkpoint: CheckpointStore,
    pub(crate) upload_lane: Box<dyn DurableQueue>,
    pub(crate) parse_lane: Box<dyn DurableQueue>,
    pub(crate) settings: JournalSettings,
    pub(crate) upload_wake: Notify,
    pub(crate) parse_wake: Notify,
    pub(crate) stop_rx: watch::Receiver<bool>,
    pub(crate) namer: PackNamer,
}

impl<L, O, H> Pipeline<L, O, H> {
    pub(crate) fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Wait for the producer's wake signal, bounded by `idle_wait`.
    pub(crate) async fn idle(&self, wake: &Notify) {
        let wait = self.settings.transfer.idle_wait_duration();
        let _ = tokio::time::timeout(wait, wake.notified()).await;
    }

    /// Pause after a failed transfer or apply.
    pub(crate) async fn backoff(&self) {
        tokio::time::sleep(self.settings.transfer.retry_backoff_duration()).await;
    }
}

/// Replicates a local document store through a bucket of journal packs.
///
/// # Example
///
/// ```rust,no_run
/// use journal_sync::{JournalSync, JournalSyncConfig, MemoryLocalStore, MemoryObjectStore};
/// use std::sync::Arc;
///
/// # async fn demo() -> journal_sync::Result<()> {
/// let config = JournalSyncConfig::for_testing("vault");
/// let local = Arc::new(MemoryLocalStore::new());
/// let remote = Arc::new(MemoryObjectStore::new());
///
/// let engine = JournalSync::open_without_hooks(config, local, remote).await?;
/// if !engine.sync().await {
///     eprintln!("sync failed, status {}", engine.status());
/// }
/// engine.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct JournalSync<L, O, H = NoOpHooks> {
    config: JournalSyncConfig,
    pool: SqlitePool,
    pipeline: Pipeline<L, O, H>,

    status_tx: watch::Sender<SyncStatus>,
    status_rx: watch::Receiver<SyncStatus>,
    stop_tx: watch::Sender<bool>,

    sync_flight: SingleFlight<SharedResult<SyncReport>>,
    receive_flight: SingleFlight<SharedResult<ReceiveReport>>,
    step_flight: SingleFlight<SharedResult<usize>>,

    /// Runs hold it shared; `reset` holds it exclusively.
    exclusive: RwLock<()>,

    /// Negotiation result, cached until `reset`.
    negotiated: Mutex<Option<ProtocolDocument>>,
}

impl<L, O> JournalSync<L, O, NoOpHooks>
where
    L: LocalStore,
    O: ObjectStoreProvider,
{
    /// Open an engine that emits no replication callbacks.
    pub async fn open_without_hooks(config: JournalSyncConfig, local: Arc<L>, remote: Arc<O>) -> Result<Self> {
        Self::open(config, local, remote, Arc::new(NoOpHooks)).await
    }
}

impl<L, O, H> JournalSync<L, O, H>
where
    L: LocalStore,
    O: ObjectStoreProvider,
    H: ReplicationHooks,
{
    /// Open checkpoint and lanes for `config.remote`.
    ///
    /// Nothing touches the bucket until the first sync.
    pub async fn open(config: JournalSyncConfig, local: Arc<L>, remote: Arc<O>, hooks: Arc<H>) -> Result<Self> {
        config.validate()?;

        let pool = db::open_pool(&config.storage).await?;
        let key = config.remote.checkpoint_key();
        let checkpoint = CheckpointStore::open(pool.clone(), key.clone()).await?;
        let upload_lane = SqliteQueue::open(pool.clone(), lane_name(&key, UPLOAD_LANE_SUFFIX)).await?;
        let parse_lane = SqliteQueue::open(pool.clone(), lane_name(&key, PARSE_LANE_SUFFIX)).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(SyncStatus::Idle);

        info!(
            bucket = %config.remote.bucket,
            prefix = %config.remote.prefix,
            checkpoint = %key,
            "Journal sync opened"
        );

        Ok(Self {
            pipeline: Pipeline {
                local,
                remote,
                hooks,
                checkpoint,
                upload_lane: Box::new(upload_lane),
                parse_lane: Box::new(parse_lane),
                settings: config.settings.clone(),
                upload_wake: Notify::new(),
                parse_wake: Notify::new(),
                stop_rx,
                namer: PackNamer::default(),
            },
            config,
            pool,
            status_tx,
            status_rx,
            stop_tx,
            sync_flight: SingleFlight::new(),
            receive_flight: SingleFlight::new(),
            step_flight: SingleFlight::new(),
            exclusive: RwLock::new(()),
            negotiated: Mutex::new(None),
        })
    }

    /// Persistence key of this remote configuration's checkpoint.
    pub fn checkpoint_key(&self) -> &str {
        self.pipeline.checkpoint.key()
    }

    pub fn config(&self) -> &JournalSyncConfig {
        &self.config
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    /// Get a receiver to watch status changes.
    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Current checkpoint value.
    pub async fn checkpoint(&self) -> CheckpointInfo {
        self.pipeline.checkpoint.get().await
    }

    /// Packs waiting on the upload lane.
    pub async fn pending_uploads(&self) -> Result<usize> {
        self.pipeline.upload_lane.len().await
    }

    /// Downloaded packs waiting to be applied.
    pub async fn pending_applies(&self) -> Result<usize> {
        self.pipeline.parse_lane.len().await
    }

    /// Receive, then send. Returns `false` on any failure.
    pub async fn sync(&self) -> bool {
        self.try_sync().await.is_ok()
    }

    /// Upload local changes only.
    pub async fn send_local_journal(&self) -> bool {
        self.try_send().await.is_ok()
    }

    /// Download and apply remote packs only.
    pub async fn receive_remote_journal(&self) -> bool {
        self.try_receive().await.is_ok()
    }

    /// Receive, then send, reporting what happened.
    pub async fn try_sync(&self) -> SharedResult<SyncReport> {
        self.sync_flight
            .run("sync", || async move {
                let _running = self.exclusive.read().await;
                let started = Instant::now();

                let outcome = async {
                    self.preflight().await.map_err(Arc::new)?;
                    self.set_status(SyncStatus::Receiving);
                    let received = self.receive_phase().await?;
                    self.set_status(SyncStatus::Sending);
                    let sent = self.send_phase().await?;
                    Ok::<_, Arc<JournalError>>(SyncReport { received, sent })
                }
                .await;

                self.finish("sync", started, outcome)
            })
            .await
    }

    /// Upload local changes only, reporting what happened.
    pub async fn try_send(&self) -> SharedResult<SendReport> {
        let _running = self.exclusive.read().await;
        let started = Instant::now();

        let outcome = async {
            self.preflight().await.map_err(Arc::new)?;
            self.set_status(SyncStatus::Sending);
            self.send_phase().await
        }
        .await;

        self.finish("send", started, outcome)
    }

    /// Download and apply remote packs only, reporting what happened.
    pub async fn try_receive(&self) -> SharedResult<ReceiveReport> {
        let _running = self.exclusive.read().await;
        let started = Instant::now();

        let outcome = async {
            self.preflight().await.map_err(Arc::new)?;
            self.set_status(SyncStatus::Receiving);
            self.receive_phase().await
        }
        .await;

        self.finish("receive", started, outcome)
    }

    /// Ask running pumps to stop after their current step.
    ///
    /// In-flight transfers are not interrupted. Runs started while stopped
    /// fail immediately until [`resume`](Self::resume).
    pub fn stop(&self) {
        info!("Stop requested");
        self.stop_tx.send_replace(true);
        self.set_status(SyncStatus::Stopped);
    }

    /// Clear the stop flag.
    pub fn resume(&self) {
        self.stop_tx.send_replace(false);
        if self.status() == SyncStatus::Stopped {
            self.set_status(SyncStatus::Idle);
        }
        info!("Resumed");
    }

    pub fn is_stopped(&self) -> bool {
        self.pipeline.is_stopped()
    }

    /// Forget all replication progress for this remote configuration.
    ///
    /// Waits for in-flight runs, then restores checkpoint defaults, erases
    /// both lanes and drops the cached negotiation.
    pub async fn reset(&self) -> Result<()> {
        let _exclusive = self.exclusive.write().await;

        self.pipeline.checkpoint.reset().await?;
        self.pipeline.upload_lane.erase_all().await?;
        self.pipeline.parse_lane.erase_all().await?;
        *self.negotiated.lock().await = None;
        self.pipeline.namer.reset();

        if !self.is_stopped() {
            self.set_status(SyncStatus::Idle);
        }
        info!(checkpoint = %self.checkpoint_key(), "Journal sync reset");
        Ok(())
    }

    /// Flush the WAL and close the database.
    pub async fn close(self) -> Result<()> {
        if self.config.storage.wal_mode {
            db::truncate_wal(&self.pool).await?;
        }
        self.pool.close().await;
        info!("Journal sync closed");
        Ok(())
    }

    /// Availability probe and protocol negotiation.
    ///
    /// Runs before anything else in a pass; a failure here leaves the
    /// checkpoint untouched.
    async fn preflight(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(JournalError::Stopped);
        }

        match self.pipeline.remote.is_available().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(JournalError::Unavailable(
                    "bucket did not answer the availability probe".to_string(),
                ))
            }
            Err(e) => return Err(JournalError::Unavailable(e.0)),
        }

        let mut negotiated = self.negotiated.lock().await;
        if negotiated.is_none() {
            let result = negotiate(
                self.pipeline.remote.as_ref(),
                self.config.remote.expected_salt.as_deref(),
                self.pipeline.checkpoint.key(),
            )
            .await?;
            debug!(outcome = ?result.outcome, version = result.document.version, "Protocol negotiated");
            *negotiated = Some(result.document);
        }
        Ok(())
    }

    async fn receive_phase(&self) -> SharedResult<ReceiveReport> {
        self.receive_flight
            .run("receive", || async move {
                let pipeline = &self.pipeline;
                let downloading = AtomicBool::new(true);
                let downloading = &downloading;

                let download = async {
                    let result = inbound::download_remote_packs(pipeline).await;
                    downloading.store(false, Ordering::SeqCst);
                    pipeline.parse_wake.notify_one();
                    result
                };
                let apply = inbound::run_applier(pipeline, downloading);

                let (downloaded, applied) = tokio::join!(download, apply);
                let downloaded = downloaded.map_err(Arc::new)?;
                let mut applied = applied.map_err(Arc::new)?;
                applied += inbound::run_applier(pipeline, downloading)
                    .await
                    .map_err(Arc::new)?;

                Ok::<_, Arc<JournalError>>(ReceiveReport {
                    downloaded: downloaded.downloaded,
                    skipped_own: downloaded.skipped_own,
                    applied_packs: applied,
                })
            })
            .await
    }

    async fn send_phase(&self) -> SharedResult<SendReport> {
        let pipeline = &self.pipeline;
        let packing = AtomicBool::new(true);
        let packing = &packing;

        let pack = async {
            let result = self
                .step_flight
                .run("pack", || async move {
                    outbound::pack_local_changes(pipeline).await.map_err(Arc::new)
                })
                .await;
            packing.store(false, Ordering::SeqCst);
            pipeline.upload_wake.notify_one();
            result
        };
        let upload = self.step_flight.run("upload", || async move {
            outbound::run_uploader(pipeline, packing).await.map_err(Arc::new)
        });

        let (packed, uploaded) = tokio::join!(pack, upload);
        let packed = packed?;
        let mut uploaded = uploaded?;

        // drain anything queued while the first pass was finishing
        uploaded += self
            .step_flight
            .run("upload", || async move {
                outbound::run_uploader(pipeline, packing).await.map_err(Arc::new)
            })
            .await?;

        Ok(SendReport { packed, uploaded })
    }

    fn finish<T>(&self, direction: &str, started: Instant, outcome: SharedResult<T>) -> SharedResult<T> {
        let elapsed = started.elapsed();
        metrics::record_sync_run(direction, outcome.is_ok(), elapsed);

        match &outcome {
            Ok(_) => {
                self.set_status(SyncStatus::Completed);
                info!(direction, elapsed_ms = elapsed.as_millis() as u64, "Journal sync finished");
            }
            Err(e) if matches!(**e, JournalError::Stopped) || self.is_stopped() => {
                self.set_status(SyncStatus::Stopped);
                warn!(direction, "Journal sync stopped");
            }
            Err(e) => {
                self.set_status(SyncStatus::Failed);
                metrics::record_error(e.kind());
                error!(direction, error = %e, retryable = e.is_retryable(), "Journal sync failed");
            }
        }
        outcome
    }

    fn set_status(&self, status: SyncStatus) {
        self.status_tx.send_replace(status);
        metrics::set_sync_status(status.as_label());
    }
}

#[cfg(test)]
pub(crate) async fn test_pipeline(
    local: Arc<crate::store::MemoryLocalStore>,
    remote: crate::object_store::MemoryObjectStore,
) -> (
    Pipeline<crate::store::MemoryLocalStore, crate::object_store::MemoryObjectStore, NoOpHooks>,
    watch::Sender<bool>,
) {
    use crate::config::{StorageConfig, TransferConfig};

    let pool = db::open_pool(&StorageConfig::in_memory()).await.unwrap();
    let checkpoint = CheckpointStore::open(pool.clone(), "cp").await.unwrap();
    let upload_lane = SqliteQueue::open(pool.clone(), lane_name("cp", UPLOAD_LANE_SUFFIX)).await.unwrap();
    let parse_lane = SqliteQueue::open(pool, lane_name("cp", PARSE_LANE_SUFFIX)).await.unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);

    let pipeline = Pipeline {
        local,
        remote: Arc::new(remote),
        hooks: Arc::new(NoOpHooks),
        checkpoint,
        upload_lane: Box::new(upload_lane),
        parse_lane: Box::new(parse_lane),
        settings: JournalSettings {
            packer: Default::default(),
            transfer: TransferConfig::testing(),
        },
        upload_wake: Notify::new(),
        parse_wake: Notify::new(),
        stop_rx,
        namer: PackNamer::default(),
    };
    (pipeline, stop_tx)
}
