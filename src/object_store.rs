// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object store providers and pack naming.
//!
//! The bucket is a flat namespace of immutable blobs. Pack files are named
//! `<unixMillis>-docs.jsonl.gz`; names starting with `_` are reserved for
//! control documents such as the protocol negotiation document.
//!
//! # Ordering
//!
//! Pack names compare numerically on their embedded timestamp
//! ([`compare_pack_names`]), so `999-…` sorts before `1000-…` even though
//! it is lexically greater. Providers return listings in this order.
//!
//! # Providers
//!
//! | Provider | Backing | Use |
//! |----------|---------|-----|
//! | [`MemoryObjectStore`] | Shared in-process map | Tests, embedding |
//! | [`FsObjectStore`] | Directory, write-then-rename | Shared folders, sneakernet |

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Suffix of every pack file name.
pub const PACK_SUFFIX: &str = "-docs.jsonl.gz";

/// Names starting with this prefix are never treated as packs.
pub const RESERVED_PREFIX: &str = "_";

/// Content type used for pack uploads.
pub const PACK_MIME: &str = "application/gzip";

/// Result type for object store operations.
pub type ObjectStoreResult<T> = std::result::Result<T, ObjectStoreError>;

/// Boxed future returned by [`ObjectStoreProvider`] methods.
pub type ObjectFuture<'a, T> = Pin<Box<dyn Future<Output = ObjectStoreResult<T>> + Send + 'a>>;

/// Transport-level failure reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreError(pub String);

impl std::fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ObjectStoreError {}

impl From<std::io::Error> for ObjectStoreError {
    fn from(e: std::io::Error) -> Self {
        ObjectStoreError(e.to_string())
    }
}

/// Pack file name for a millisecond stamp.
pub fn pack_name(stamp_ms: u64) -> String {
    format!("{}{}", stamp_ms, PACK_SUFFIX)
}

/// Timestamp embedded in a pack name, if it is one.
pub fn parse_pack_timestamp(name: &str) -> Option<u64> {
    let digits = name.strip_suffix(PACK_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Whether a bucket key names a pack file.
pub fn is_pack_name(name: &str) -> bool {
    !name.starts_with(RESERVED_PREFIX) && parse_pack_timestamp(name).is_some()
}

/// Numeric-aware comparison of bucket keys.
///
/// The leading digit run is compared as a number; ties and keys without
/// digits fall back to plain string order.
pub fn compare_pack_names(a: &str, b: &str) -> Ordering {
    match (leading_number(a), leading_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn leading_number(name: &str) -> Option<u128> {
    let end = name.bytes().take_while(u8::is_ascii_digit).count();
    if end == 0 {
        return None;
    }
    // Overlong digit runs saturate and fall back to string order on ties.
    Some(name[..end].parse().unwrap_or(u128::MAX))
}

/// Keys strictly after `after`, sorted, truncated to `limit`.
fn select_listing<I>(keys: I, after: Option<&str>, limit: Option<usize>) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut selected: Vec<String> = keys
        .into_iter()
        .filter(|key| after.map_or(true, |after| compare_pack_names(key, after) == Ordering::Greater))
        .collect();
    selected.sort_by(|a, b| compare_pack_names(a, b));
    if let Some(limit) = limit {
        selected.truncate(limit);
    }
    selected
}

/// A flat bucket of named blobs.
///
/// Errors and `false`/`None` results are treated alike by the engine.
pub trait ObjectStoreProvider: Send + Sync + 'static {
    /// Store a blob. Returns whether the provider accepted it.
    fn upload(&self, key: &str, data: Vec<u8>, mime: &str) -> ObjectFuture<'_, bool>;

    /// Fetch a blob; `None` when absent.
    fn download(&self, key: &str) -> ObjectFuture<'_, Option<Vec<u8>>>;

    /// Keys strictly after `after` in [`compare_pack_names`] order.
    fn list(&self, after: Option<&str>, limit: Option<usize>) -> ObjectFuture<'_, Vec<String>>;

    /// Availability probe run before any exchange.
    fn is_available(&self) -> ObjectFuture<'_, bool>;

    /// Delete keys, returning how many existed.
    fn delete(&self, keys: Vec<String>) -> ObjectFuture<'_, usize>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    mime: String,
}

/// In-memory bucket.
///
/// Clones share the same bucket, so two engines built over clones see each
/// other's uploads like two devices on one remote.
#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    available: Arc<AtomicBool>,
    downloads: Arc<RwLock<Vec<String>>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            downloads: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Simulate the bucket going offline or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    pub async fn keys(&self) -> Vec<String> {
        select_listing(self.objects.read().await.keys().cloned(), None, None)
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).map(|o| o.data.clone())
    }

    pub async fn mime(&self, key: &str) -> Option<String> {
        self.objects.read().await.get(key).map(|o| o.mime.clone())
    }

    /// Put a blob directly, bypassing availability.
    pub async fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        self.objects.write().await.insert(
            key.into(),
            StoredObject {
                data,
                mime: PACK_MIME.to_string(),
            },
        );
    }

    /// Every key passed to `download`, in call order.
    pub async fn downloaded_keys(&self) -> Vec<String> {
        self.downloads.read().await.clone()
    }

    fn check_available(&self) -> ObjectStoreResult<()> {
        if self.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(ObjectStoreError("bucket unavailable".to_string()))
        }
    }
}

impl ObjectStoreProvider for MemoryObjectStore {
    fn upload(&self, key: &str, data: Vec<u8>, mime: &str) -> ObjectFuture<'_, bool> {
        let key = key.to_string();
        let mime = mime.to_string();
        Box::pin(async move {
            self.check_available()?;
            self.objects.write().await.insert(key, StoredObject { data, mime });
            Ok(true)
        })
    }

    fn download(&self, key: &str) -> ObjectFuture<'_, Option<Vec<u8>>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check_available()?;
            self.downloads.write().await.push(key.clone());
            Ok(self.objects.read().await.get(&key).map(|o| o.data.clone()))
        })
    }

    fn list(&self, after: Option<&str>, limit: Option<usize>) -> ObjectFuture<'_, Vec<String>> {
        let after = after.map(str::to_string);
        Box::pin(async move {
            self.check_available()?;
            let objects = self.objects.read().await;
            Ok(select_listing(objects.keys().cloned(), after.as_deref(), limit))
        })
    }

    fn is_available(&self) -> ObjectFuture<'_, bool> {
        Box::pin(async move { Ok(self.available.load(AtomicOrdering::SeqCst)) })
    }

    fn delete(&self, keys: Vec<String>) -> ObjectFuture<'_, usize> {
        Box::pin(async move {
            self.check_available()?;
            let mut objects = self.objects.write().await;
            Ok(keys.iter().filter(|key| objects.remove(*key).is_some()).count())
        })
    }
}

/// Directory-backed bucket.
///
/// Uploads land in a dot-prefixed temporary file and are renamed into
/// place, so a listing never shows a partially written pack.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> ObjectStoreResult<PathBuf> {
        let flat = !key.is_empty()
            && !key.starts_with('.')
            && !key.contains(['/', '\\'])
            && !key.contains('\0');
        if !flat {
            return Err(ObjectStoreError(format!("invalid object key: {:?}", key)));
        }
        Ok(self.root.join(key))
    }
}

impl ObjectStoreProvider for FsObjectStore {
    fn upload(&self, key: &str, data: Vec<u8>, _mime: &str) -> ObjectFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move {
            let target = self.path_for(&key)?;
            let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            let staging = self.root.join(format!(".{}.{}.tmp", key, nanos));

            tokio::fs::write(&staging, &data).await?;
            if let Err(e) = tokio::fs::rename(&staging, &target).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e.into());
            }
            debug!(key = %key, bytes = data.len(), "Wrote object");
            Ok(true)
        })
    }

    fn download(&self, key: &str) -> ObjectFuture<'_, Option<Vec<u8>>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.path_for(&key)?;
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list(&self, after: Option<&str>, limit: Option<usize>) -> ObjectFuture<'_, Vec<String>> {
        let after = after.map(str::to_string);
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(&self.root).await?;
            let mut keys = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if !name.starts_with('.') {
                    keys.push(name);
                }
            }
            Ok(select_listing(keys, after.as_deref(), limit))
        })
    }

    fn is_available(&self) -> ObjectFuture<'_, bool> {
        Box::pin(async move {
            Ok(tokio::fs::metadata(&self.root)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false))
        })
    }

    fn delete(&self, keys: Vec<String>) -> ObjectFuture<'_, usize> {
        Box::pin(async move {
            let mut removed = 0;
            for key in keys {
                let path = self.path_for(&key)?;
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pack_name_roundtrip() {
        let name = pack_name(1_700_000_000_123);
        assert_eq!(name, "1700000000123-docs.jsonl.gz");
        assert_eq!(parse_pack_timestamp(&name), Some(1_700_000_000_123));
    }

    #[test]
    fn test_non_pack_names() {
        assert!(!is_pack_name("_journal_sync_protocol.json"));
        assert!(!is_pack_name("notes.txt"));
        assert!(!is_pack_name("-docs.jsonl.gz"));
        assert!(!is_pack_name("12a-docs.jsonl.gz"));
        assert!(is_pack_name("5-docs.jsonl.gz"));
    }

    #[test]
    fn test_compare_is_numeric_aware() {
        assert_eq!(
            compare_pack_names("999-docs.jsonl.gz", "1000-docs.jsonl.gz"),
            Ordering::Less
        );
        assert_eq!(compare_pack_names("10-docs.jsonl.gz", "10-docs.jsonl.gz"), Ordering::Equal);
        assert_eq!(compare_pack_names("1-docs.jsonl.gz", "_protocol"), Ordering::Less);
        assert_eq!(compare_pack_names("a", "b"), Ordering::Less);
    }

    #[test]
    fn test_select_listing() {
        let keys = vec![
            "1000-docs.jsonl.gz".to_string(),
            "999-docs.jsonl.gz".to_string(),
            "5-docs.jsonl.gz".to_string(),
        ];
        assert_eq!(
            select_listing(keys.clone(), Some("5-docs.jsonl.gz"), None),
            vec!["999-docs.jsonl.gz", "1000-docs.jsonl.gz"]
        );
        assert_eq!(select_listing(keys, None, Some(1)), vec!["5-docs.jsonl.gz"]);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_sharing() {
        let store = MemoryObjectStore::new();
        let other = store.clone();

        assert!(store.upload("1-docs.jsonl.gz", vec![1, 2], PACK_MIME).await.unwrap());
        assert_eq!(other.download("1-docs.jsonl.gz").await.unwrap(), Some(vec![1, 2]));
        assert_eq!(other.download("missing").await.unwrap(), None);
        assert_eq!(other.mime("1-docs.jsonl.gz").await.as_deref(), Some(PACK_MIME));
        assert_eq!(
            store.downloaded_keys().await,
            vec!["1-docs.jsonl.gz".to_string(), "missing".to_string()]
        );
    }

    #[tokio::test]
    async fn test_memory_store_unavailable() {
        let store = MemoryObjectStore::new();
        store.set_available(false);
        assert!(!store.is_available().await.unwrap());
        assert!(store.upload("1-docs.jsonl.gz", vec![], PACK_MIME).await.is_err());
        assert!(store.list(None, None).await.is_err());

        store.set_available(true);
        assert!(store.is_available().await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_delete() {
        let store = MemoryObjectStore::new();
        store.insert("1-docs.jsonl.gz", vec![1]).await;
        let removed = store
            .delete(vec!["1-docs.jsonl.gz".into(), "2-docs.jsonl.gz".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        assert!(store.is_available().await.unwrap());
        store.upload("20-docs.jsonl.gz", vec![9], PACK_MIME).await.unwrap();
        store.upload("3-docs.jsonl.gz", vec![8], PACK_MIME).await.unwrap();

        assert_eq!(
            store.list(None, None).await.unwrap(),
            vec!["3-docs.jsonl.gz", "20-docs.jsonl.gz"]
        );
        assert_eq!(
            store.list(Some("3-docs.jsonl.gz"), None).await.unwrap(),
            vec!["20-docs.jsonl.gz"]
        );
        assert_eq!(store.download("20-docs.jsonl.gz").await.unwrap(), Some(vec![9]));
        assert_eq!(store.download("4-docs.jsonl.gz").await.unwrap(), None);
        assert_eq!(store.delete(vec!["3-docs.jsonl.gz".into()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_nested_keys() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.upload("../escape", vec![], PACK_MIME).await.is_err());
        assert!(store.download("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_store_missing_root_is_unavailable() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("absent"));
        assert!(!store.is_available().await.unwrap());
    }
}
