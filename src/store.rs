// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local document store integration.
//!
//! The engine never owns documents; it reads the host store's change feed
//! and writes replicated revisions back through [`LocalStore`]. Embedders
//! implement the trait over their database. [`MemoryLocalStore`] is a
//! complete in-memory implementation used by tests and small embedders.
//!
//! # Example
//!
//! ```rust,no_run
//! use journal_sync::store::{LocalStore, MemoryLocalStore};
//! use journal_sync::document::{ChunkDoc, RegularDoc};
//!
//! # async fn demo() {
//! let store = MemoryLocalStore::new();
//! store.put_chunk(ChunkDoc::new("h:deadbeef", "hello")).await;
//! store.put_document(RegularDoc::new("test.md", "1-abc")).await;
//!
//! let feed = store.changes_since(0, 100).await.unwrap();
//! assert_eq!(feed.results.len(), 2);
//! # }
//! ```

use crate::document::{is_chunk_id, revision_dockey, ChunkDoc, Document, RegularDoc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Result type for local store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures returned by the store traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Simplified error reported by a local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// One change-feed entry: a document and all its current leaf revisions.
///
/// Chunks carry no revisions; their id is their identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub seq: u64,
    pub id: String,
    pub revs: Vec<String>,
}

impl ChangeEntry {
    pub fn is_chunk(&self) -> bool {
        is_chunk_id(&self.id)
    }

    /// Dedup keys this entry would produce when packed.
    pub fn dockeys(&self) -> Vec<String> {
        if self.is_chunk() {
            vec![self.id.clone()]
        } else {
            self.revs.iter().map(|rev| revision_dockey(&self.id, rev)).collect()
        }
    }
}

/// A page of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesBatch {
    pub results: Vec<ChangeEntry>,
    /// Feed position of the last entry in `results` (or `since` when empty).
    pub last_seq: u64,
}

/// Outcome of writing one replicated revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocWriteResult {
    pub id: String,
    pub revision: String,
    pub error: Option<String>,
}

impl DocWriteResult {
    pub fn ok(id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: revision.into(),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, revision: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: revision.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn dockey(&self) -> String {
        revision_dockey(&self.id, &self.revision)
    }
}

/// What the engine needs from the host document store.
///
/// Every method may fail transiently; the pipelines turn failures into
/// queue cancels or abort the current run.
pub trait LocalStore: Send + Sync + 'static {
    /// Current head position of the change feed.
    fn update_seq(&self) -> BoxFuture<'_, u64>;

    /// Up to `limit` entries strictly after `since`, in feed order.
    ///
    /// Entries list every leaf revision, conflicting ones included.
    fn changes_since(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesBatch>;

    /// Full bodies for the listed entries and revisions.
    ///
    /// Revisions that no longer exist are skipped silently.
    fn bulk_get(&self, entries: Vec<ChangeEntry>) -> BoxFuture<'_, Vec<Document>>;

    /// Which of `ids` already exist as chunks.
    fn existing_chunk_ids(&self, ids: Vec<String>) -> BoxFuture<'_, HashSet<String>>;

    /// Insert a chunk. Content-addressed: an existing id is left as is.
    fn insert_chunk(&self, chunk: ChunkDoc) -> BoxFuture<'_, ()>;

    /// The `(id, revision)` pairs the store does not hold yet.
    fn revs_diff(&self, pairs: Vec<(String, String)>) -> BoxFuture<'_, Vec<(String, String)>>;

    /// Store revisions exactly as given, keeping their history.
    ///
    /// No new revision is minted. One result per input document.
    fn bulk_insert_replicated(&self, docs: Vec<RegularDoc>) -> BoxFuture<'_, Vec<DocWriteResult>>;
}

/// Revisions of one document id.
#[derive(Debug, Default)]
struct DocRecord {
    revisions: BTreeMap<String, RegularDoc>,
}

impl DocRecord {
    /// Revisions that are nobody's ancestor.
    fn leaves(&self) -> Vec<String> {
        let ancestors: HashSet<String> = self.revisions.values().flat_map(ancestor_revisions).collect();
        self.revisions
            .keys()
            .filter(|rev| !ancestors.contains(*rev))
            .cloned()
            .collect()
    }
}

/// Ancestors named by a document's `_revisions` history.
fn ancestor_revisions(doc: &RegularDoc) -> Vec<String> {
    let Some(history) = doc.fields.get("_revisions") else {
        return Vec::new();
    };
    let start = history.get("start").and_then(Value::as_u64).unwrap_or(0);
    let ids = history.get("ids").and_then(Value::as_array).cloned().unwrap_or_default();

    ids.iter()
        .enumerate()
        .skip(1)
        .filter_map(|(depth, hash)| {
            let generation = start.checked_sub(depth as u64)?;
            Some(format!("{}-{}", generation, hash.as_str()?))
        })
        .collect()
}

#[derive(Debug, Default)]
struct MemoryState {
    seq: u64,
    chunks: HashMap<String, String>,
    docs: HashMap<String, DocRecord>,
    /// Latest feed position per id.
    id_seq: HashMap<String, u64>,
    feed: BTreeMap<u64, String>,
    failing_chunks: HashSet<String>,
    failing_docs: HashSet<String>,
}

impl MemoryState {
    fn touch(&mut self, id: &str) {
        self.seq += 1;
        if let Some(previous) = self.id_seq.insert(id.to_string(), self.seq) {
            self.feed.remove(&previous);
        }
        self.feed.insert(self.seq, id.to_string());
    }

    fn entry_for(&self, seq: u64, id: &str) -> ChangeEntry {
        let revs = self.docs.get(id).map(DocRecord::leaves).unwrap_or_default();
        ChangeEntry {
            seq,
            id: id.to_string(),
            revs,
        }
    }
}

/// In-memory [`LocalStore`].
///
/// Every chunk insert and document write bumps the feed; an id appears in
/// the feed once, at its latest position.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    state: RwLock<MemoryState>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locally authored chunk.
    pub async fn put_chunk(&self, chunk: ChunkDoc) {
        let mut state = self.state.write().await;
        if !state.chunks.contains_key(&chunk.id) {
            state.chunks.insert(chunk.id.clone(), chunk.data);
            state.touch(&chunk.id);
        }
    }

    /// Record a locally authored document revision.
    pub async fn put_document(&self, doc: RegularDoc) {
        let mut state = self.state.write().await;
        let id = doc.id.clone();
        state
            .docs
            .entry(id.clone())
            .or_default()
            .revisions
            .insert(doc.revision.clone(), doc);
        state.touch(&id);
    }

    pub async fn chunk(&self, id: &str) -> Option<String> {
        self.state.read().await.chunks.get(id).cloned()
    }

    pub async fn chunk_count(&self) -> usize {
        self.state.read().await.chunks.len()
    }

    /// Every stored revision of `id`, sorted.
    pub async fn revisions(&self, id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .docs
            .get(id)
            .map(|record| record.revisions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn document(&self, id: &str, revision: &str) -> Option<RegularDoc> {
        self.state
            .read()
            .await
            .docs
            .get(id)
            .and_then(|record| record.revisions.get(revision))
            .cloned()
    }

    /// Make inserts of this chunk id fail.
    pub async fn fail_chunk_insert(&self, id: &str) {
        self.state.write().await.failing_chunks.insert(id.to_string());
    }

    /// Make replicated writes of this document id fail.
    pub async fn fail_document_insert(&self, id: &str) {
        self.state.write().await.failing_docs.insert(id.to_string());
    }
}

impl LocalStore for MemoryLocalStore {
    fn update_seq(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move { Ok(self.state.read().await.seq) })
    }

    fn changes_since(&self, since: u64, limit: usize) -> BoxFuture<'_, ChangesBatch> {
        Box::pin(async move {
            let state = self.state.read().await;
            let results: Vec<ChangeEntry> = state
                .feed
                .range(since.saturating_add(1)..)
                .take(limit)
                .map(|(seq, id)| state.entry_for(*seq, id))
                .collect();
            let last_seq = results.last().map(|entry| entry.seq).unwrap_or(since);
            Ok(ChangesBatch { results, last_seq })
        })
    }

    fn bulk_get(&self, entries: Vec<ChangeEntry>) -> BoxFuture<'_, Vec<Document>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut docs = Vec::new();
            for entry in entries {
                if entry.is_chunk() {
                    if let Some(data) = state.chunks.get(&entry.id) {
                        docs.push(Document::Chunk(ChunkDoc::new(entry.id.clone(), data.clone())));
                    }
                    continue;
                }
                let Some(record) = state.docs.get(&entry.id) else {
                    continue;
                };
                for rev in &entry.revs {
                    if let Some(doc) = record.revisions.get(rev) {
                        docs.push(Document::Regular(doc.clone()));
                    }
                }
            }
            Ok(docs)
        })
    }

    fn existing_chunk_ids(&self, ids: Vec<String>) -> BoxFuture<'_, HashSet<String>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(ids.into_iter().filter(|id| state.chunks.contains_key(id)).collect())
        })
    }

    fn insert_chunk(&self, chunk: ChunkDoc) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.failing_chunks.contains(&chunk.id) {
                return Err(StoreError(format!("chunk {} rejected", chunk.id)));
            }
            if !state.chunks.contains_key(&chunk.id) {
                state.chunks.insert(chunk.id.clone(), chunk.data);
                state.touch(&chunk.id);
            }
            Ok(())
        })
    }

    fn revs_diff(&self, pairs: Vec<(String, String)>) -> BoxFuture<'_, Vec<(String, String)>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(pairs
                .into_iter()
                .filter(|(id, rev)| {
                    !state
                        .docs
                        .get(id)
                        .is_some_and(|record| record.revisions.contains_key(rev))
                })
                .collect())
        })
    }

    fn bulk_insert_replicated(&self, docs: Vec<RegularDoc>) -> BoxFuture<'_, Vec<DocWriteResult>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut results = Vec::with_capacity(docs.len());
            for doc in docs {
                if state.failing_docs.contains(&doc.id) {
                    results.push(DocWriteResult::failed(&doc.id, &doc.revision, "write rejected"));
                    continue;
                }
                let id = doc.id.clone();
                let revision = doc.revision.clone();
                let record = state.docs.entry(id.clone()).or_default();
                if record.revisions.contains_key(&revision) {
                    results.push(DocWriteResult::ok(id, revision));
                    continue;
                }
                record.revisions.insert(revision.clone(), doc);
                state.touch(&id);
                results.push(DocWriteResult::ok(id, revision));
            }
            Ok(results)
        })
    }
}
