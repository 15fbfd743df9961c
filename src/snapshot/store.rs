// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Object stores and the snapshot layout on top of them.
//!
//! # Layout
//!
//! ```text
//! {prefix}{channel}/snapshot-{millis}-{sha8}.json.zst   immutable bodies
//! {prefix}{channel}/latest                            key of the newest body
//! ```
//!
//! A body is always fully written before `latest` is pointed at it, so a
//! reader never sees a partial snapshot. Old bodies are left for an external
//! retention job.

use super::Snapshot;
use crate::error::{ChannelError, Result};
use crate::metrics;
use crate::BoxFuture;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Flat key/value blob storage (one bucket).
pub trait ObjectStore: Send + Sync + 'static {
    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, ()>;

    /// `None` when the key does not exist.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Vec<u8>>>;

    /// Keys starting with `prefix`, sorted.
    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>>;

    /// Deleting a missing key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════════════

/// Object store held in a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        self.objects.insert(key.to_string(), bytes);
        Box::pin(async { Ok(()) })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        let value = self.objects.get(key).map(|entry| entry.value().clone());
        Box::pin(async move { Ok(value) })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Box::pin(async move { Ok(keys) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        self.objects.remove(key);
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Local directory
// ═══════════════════════════════════════════════════════════════════════════════

/// Object store backed by a directory; `/` in keys maps to subdirectories.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, operation: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ChannelError::object_store(operation, key, "invalid key"));
        }
        Ok(self.root.join(relative))
    }

    async fn put_file(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for("put", key)?;
        let io_err = |e: std::io::Error| ChannelError::object_store("put", key, e.to_string());

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        // Write then rename so readers never see a partial object
        let tmp = path.with_extension("tmp-write");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }

    async fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for("get", key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChannelError::object_store("get", key, e.to_string())),
        }
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let io_err = |e: std::io::Error| ChannelError::object_store("list", prefix, e.to_string());
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(io_err)?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.ends_with(".tmp-write") {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        let path = self.path_for("delete", key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChannelError::object_store("delete", key, e.to_string())),
        }
    }
}

impl ObjectStore for LocalObjectStore {
    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(self.put_file(key, bytes))
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(self.get_file(key))
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(self.list_files(prefix))
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.delete_file(key))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot store
// ═══════════════════════════════════════════════════════════════════════════════

/// Writes and reads snapshots under a key prefix.
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    compress: bool,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            compress: true,
        }
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn channel_prefix(&self, channel: &str) -> String {
        format!("{}{}/", self.prefix, channel)
    }

    /// Key of the `latest` pointer for `channel`.
    pub fn latest_key(&self, channel: &str) -> String {
        format!("{}latest", self.channel_prefix(channel))
    }

    /// Write a new body, then repoint `latest` at it.
    ///
    /// Returns the key of the body.
    pub async fn write(&self, snapshot: &Snapshot) -> Result<String> {
        let encoded = snapshot.encode(self.compress)?;
        let extension = if self.compress { "json.zst" } else { "json" };
        let key = format!(
            "{}snapshot-{}-{}.{}",
            self.channel_prefix(&snapshot.channel),
            snapshot.created_at.timestamp_millis(),
            &encoded.checksum[..8],
            extension
        );
        let size = encoded.bytes.len();

        self.store.put(&key, encoded.bytes).await?;
        self.store
            .put(&self.latest_key(&snapshot.channel), key.clone().into_bytes())
            .await?;

        metrics::record_snapshot_written(&snapshot.channel, size);
        info!(
            channel = %snapshot.channel,
            key = %key,
            entries = snapshot.len(),
            bytes = size,
            position = %snapshot.position,
            "Snapshot published"
        );
        Ok(key)
    }

    /// Read and verify the snapshot at `key`.
    pub async fn read(&self, key: &str) -> Result<Snapshot> {
        let bytes = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| ChannelError::Snapshot(format!("snapshot object '{}' is missing", key)))?;
        Snapshot::decode(&bytes)
    }

    /// The snapshot `latest` points at, or `None` if there is none yet.
    pub async fn read_latest(&self, channel: &str) -> Result<Option<Snapshot>> {
        let Some(pointer) = self.store.get(&self.latest_key(channel)).await? else {
            debug!(channel, "No snapshot published yet");
            return Ok(None);
        };
        let key = String::from_utf8(pointer)
            .map_err(|_| ChannelError::Snapshot(format!("latest pointer of '{}' is not UTF-8", channel)))?;

        let snapshot = self.read(key.trim()).await?;
        if snapshot.channel != channel {
            return Err(ChannelError::Snapshot(format!(
                "snapshot '{}' belongs to channel '{}', not '{}'",
                key, snapshot.channel, channel
            )));
        }
        Ok(Some(snapshot))
    }

    /// Keys of every snapshot body of `channel`, oldest first.
    pub async fn list(&self, channel: &str) -> Result<Vec<String>> {
        let latest = self.latest_key(channel);
        let keys = self.store.list(&self.channel_prefix(channel)).await?;
        Ok(keys.into_iter().filter(|k| *k != latest).collect())
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("prefix", &self.prefix)
            .field("compress", &self.compress)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{ChannelPosition, ShardPosition};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot(channel: &str, token: &str) -> Snapshot {
        let mut entries = BTreeMap::new();
        entries.insert("k2".to_string(), json!({ "b": 2 }));
        Snapshot::new(
            channel,
            ChannelPosition::new().with(ShardPosition::at("shard-0", token)),
            entries,
        )
    }

    #[tokio::test]
    async fn test_in_memory_store_basics() {
        let store = InMemoryObjectStore::new();
        store.put("a/1", b"one".to_vec()).await.unwrap();
        store.put("a/2", b"two".to_vec()).await.unwrap();
        store.put("b/1", b"three".to_vec()).await.unwrap();

        assert_eq!(store.get("a/1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("zzz").await.unwrap(), None);
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/1", "a/2"]);

        store.delete("a/1").await.unwrap();
        store.delete("a/1").await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_local_store_basics() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store.put("snapshots/orders/latest", b"x".to_vec()).await.unwrap();
        store.put("snapshots/orders/snapshot-1", b"y".to_vec()).await.unwrap();
        store.put("other", b"z".to_vec()).await.unwrap();

        assert_eq!(
            store.get("snapshots/orders/latest").await.unwrap(),
            Some(b"x".to_vec())
        );
        assert_eq!(store.get("snapshots/missing").await.unwrap(), None);
        assert_eq!(
            store.list("snapshots/").await.unwrap(),
            vec!["snapshots/orders/latest", "snapshots/orders/snapshot-1"]
        );

        store.delete("other").await.unwrap();
        store.delete("other").await.unwrap();
        assert_eq!(store.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        for key in ["../evil", "/abs", "", "a/../../b"] {
            let err = store.put(key, Vec::new()).await.unwrap_err();
            assert!(matches!(err, ChannelError::ObjectStore { .. }), "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_read_latest_without_pointer() {
        let snapshots = SnapshotStore::new(Arc::new(InMemoryObjectStore::new()), "snapshots/");
        assert!(snapshots.read_latest("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_latest() {
        let objects = Arc::new(InMemoryObjectStore::new());
        let snapshots = SnapshotStore::new(objects.clone(), "snapshots/");

        let first = snapshots.write(&snapshot("orders", "1")).await.unwrap();
        assert!(first.starts_with("snapshots/orders/snapshot-"));
        assert!(first.ends_with(".json.zst"));

        let latest = snapshots.read_latest("orders").await.unwrap().unwrap();
        assert_eq!(latest.position.lookup("shard-0").token(), Some("1"));

        let second = snapshots.write(&snapshot("orders", "2")).await.unwrap();
        assert_ne!(first, second);
        let latest = snapshots.read_latest("orders").await.unwrap().unwrap();
        assert_eq!(latest.position.lookup("shard-0").token(), Some("2"));

        let listed = snapshots.list("orders").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first));
    }

    #[tokio::test]
    async fn test_corrupt_body_is_rejected() {
        let objects = Arc::new(InMemoryObjectStore::new());
        let snapshots =
            SnapshotStore::new(objects.clone(), "snapshots/").with_compression(false);

        let key = snapshots.write(&snapshot("orders", "1")).await.unwrap();
        let body = objects.get(&key).await.unwrap().unwrap();
        let corrupted = String::from_utf8(body).unwrap().replace("\"b\":2", "\"b\":9");
        objects.put(&key, corrupted.into_bytes()).await.unwrap();

        let err = snapshots.read_latest("orders").await.unwrap_err();
        assert!(matches!(err, ChannelError::Snapshot(_)));
    }

    #[tokio::test]
    async fn test_dangling_pointer_is_an_error() {
        let objects = Arc::new(InMemoryObjectStore::new());
        let snapshots = SnapshotStore::new(objects.clone(), "snapshots/");
        objects
            .put("snapshots/orders/latest", b"snapshots/orders/gone".to_vec())
            .await
            .unwrap();

        assert!(snapshots.read_latest("orders").await.is_err());
    }
}
