// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Replica construction over a shared in-memory bucket
//! - A fault-injecting object store wrapper
//! - Hooks that record every callback

#![allow(dead_code)]

use journal_sync::object_store::{ObjectFuture, ObjectStoreError, PACK_SUFFIX};
use journal_sync::{
    ChunkDoc, JournalSync, JournalSyncConfig, MemoryLocalStore, MemoryObjectStore, ObjectStoreProvider,
    RegularDoc, ReplicationHooks,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type MemoryReplica = JournalSync<MemoryLocalStore, MemoryObjectStore>;

/// Open a replica with its own in-memory database over `remote`.
pub async fn replica(remote: &MemoryObjectStore) -> (MemoryReplica, Arc<MemoryLocalStore>) {
    let local = Arc::new(MemoryLocalStore::new());
    let engine = JournalSync::open_without_hooks(
        JournalSyncConfig::for_testing("vault"),
        local.clone(),
        Arc::new(remote.clone()),
    )
    .await
    .expect("Failed to open replica");
    (engine, local)
}

/// A document revision with a one-entry `_revisions` history.
pub fn note(id: &str, generation: u64, hash: &str, body: &str) -> RegularDoc {
    RegularDoc::new(id, format!("{}-{}", generation, hash))
        .with_field("body", json!(body))
        .with_field("_revisions", json!({ "start": generation, "ids": [hash] }))
}

/// The chunk and document used by the end-to-end scenario.
pub async fn seed_hello(local: &MemoryLocalStore) {
    local.put_chunk(ChunkDoc::new("h:deadbeef", "hello")).await;
    local.put_document(RegularDoc::new("test.md", "1-abc")).await;
}

// =============================================================================
// Fault-injecting object store
// =============================================================================

/// Wraps a [`MemoryObjectStore`] and fails selected operations.
///
/// Only pack transfers are affected, so protocol negotiation still
/// succeeds.
#[derive(Debug, Clone)]
pub struct FlakyObjectStore {
    pub inner: MemoryObjectStore,
    pack_upload_failures: Arc<AtomicUsize>,
    fail_uploads_forever: Arc<AtomicBool>,
    fail_downloads: Arc<AtomicBool>,
    pack_upload_attempts: Arc<AtomicUsize>,
    pack_upload_delay: Arc<Mutex<Option<Duration>>>,
}

impl FlakyObjectStore {
    pub fn new(inner: MemoryObjectStore) -> Self {
        Self {
            inner,
            pack_upload_failures: Arc::new(AtomicUsize::new(0)),
            fail_uploads_forever: Arc::new(AtomicBool::new(false)),
            fail_downloads: Arc::new(AtomicBool::new(false)),
            pack_upload_attempts: Arc::new(AtomicUsize::new(0)),
            pack_upload_delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Fail the next `count` pack uploads.
    pub fn fail_pack_uploads(&self, count: usize) {
        self.pack_upload_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_pack_uploads(&self, fail: bool) {
        self.fail_uploads_forever.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pack_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    /// Stall the next pack upload for `delay` before it reaches the bucket.
    pub fn delay_next_pack_upload(&self, delay: Duration) {
        *self.pack_upload_delay.lock().unwrap() = Some(delay);
    }

    pub fn pack_upload_attempts(&self) -> usize {
        self.pack_upload_attempts.load(Ordering::SeqCst)
    }

    fn take_upload_failure(&self) -> bool {
        if self.fail_uploads_forever.load(Ordering::SeqCst) {
            return true;
        }
        self.pack_upload_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ObjectStoreProvider for FlakyObjectStore {
    fn upload(&self, key: &str, data: Vec<u8>, mime: &str) -> ObjectFuture<'_, bool> {
        let mut delay = None;
        if key.ends_with(PACK_SUFFIX) {
            self.pack_upload_attempts.fetch_add(1, Ordering::SeqCst);
            if self.take_upload_failure() {
                return Box::pin(async { Err(ObjectStoreError("injected upload failure".to_string())) });
            }
            delay = self.pack_upload_delay.lock().unwrap().take();
        }
        let upload = self.inner.upload(key, data, mime);
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            upload.await
        })
    }

    fn download(&self, key: &str) -> ObjectFuture<'_, Option<Vec<u8>>> {
        if key.ends_with(PACK_SUFFIX) && self.fail_downloads.load(Ordering::SeqCst) {
            return Box::pin(async { Err(ObjectStoreError("injected download failure".to_string())) });
        }
        self.inner.download(key)
    }

    fn list(&self, after: Option<&str>, limit: Option<usize>) -> ObjectFuture<'_, Vec<String>> {
        self.inner.list(after, limit)
    }

    fn is_available(&self) -> ObjectFuture<'_, bool> {
        self.inner.is_available()
    }

    fn delete(&self, keys: Vec<String>) -> ObjectFuture<'_, usize> {
        self.inner.delete(keys)
    }
}

// =============================================================================
// Recording hooks
// =============================================================================

/// Records every callback the applier makes.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    pub chunks: Mutex<Vec<String>>,
    pub docs: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn chunk_ids(&self) -> Vec<String> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn doc_keys(&self) -> Vec<String> {
        self.docs.lock().unwrap().clone()
    }
}

impl ReplicationHooks for RecordingHooks {
    fn on_chunk_arrived(&self, chunks: &[ChunkDoc]) {
        self.chunks.lock().unwrap().extend(chunks.iter().map(|c| c.id.clone()));
    }

    fn on_replication_result(&self, docs: &[RegularDoc]) {
        self.docs.lock().unwrap().extend(docs.iter().map(RegularDoc::dockey));
    }
}
