//! Durable per-partition progress.
//!
//! A checkpoint maps `(topic, partition)` to the highest offset such that every
//! record at or below it has been acknowledged by the sink at least once.
//! Pipelines are the only writers, one per partition, so the store never sees
//! two concurrent saves for the same key from this process. A second process
//! in the same group can still race us after a rebalance, which is what the
//! conditional writes and the regression check catch.
//!
//! [`ObjectStoreCheckpointStore`] keeps one small JSON object per partition:
//!
//! ```text
//! <prefix>/<topic>/<partition>.json
//! {"topic":"orders","partition":3,"offset":41,"updated_at_ms":1700000000000}
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, UpdateVersion};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::record::TopicPartition;
use crate::retry::Retryable;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by a [`CheckpointStore`].
#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    /// The backend could not be reached or failed the request.
    #[error("checkpoint storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Another writer got there first, or the write would move progress backwards.
    #[error("checkpoint conflict: {0}")]
    Conflict(String),

    /// A stored checkpoint could not be decoded.
    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),

    /// The checkpoint location URI is not usable.
    #[error("invalid checkpoint location: {0}")]
    InvalidLocation(String),
}

impl Retryable for CheckpointError {
    fn is_retryable(&self) -> bool {
        matches!(self, CheckpointError::StorageUnavailable(_))
    }
}

impl From<object_store::Error> for CheckpointError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::AlreadyExists { path, .. }
            | object_store::Error::Precondition { path, .. } => {
                CheckpointError::Conflict(format!("concurrent update of {}", path))
            }
            other => CheckpointError::StorageUnavailable(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore trait
// ---------------------------------------------------------------------------

/// Durable mapping `(topic, partition) → last acknowledged offset`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the stored offset, or `None` when the partition was never checkpointed.
    async fn load(&self, tp: &TopicPartition) -> Result<Option<u64>, CheckpointError>;

    /// Atomically store `offset`. A later `load` observes a value ≥ `offset`.
    async fn save(&self, tp: &TopicPartition, offset: u64) -> Result<(), CheckpointError>;
}

/// Serialized form of one partition checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub topic: String,
    pub partition: u32,
    /// Every offset ≤ this value has been acknowledged at least once.
    pub offset: u64,
    pub updated_at_ms: u64,
}

impl CheckpointEntry {
    fn new(tp: &TopicPartition, offset: u64) -> Self {
        let updated_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset,
            updated_at_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectStoreCheckpointStore
// ---------------------------------------------------------------------------

/// A [`CheckpointStore`] backed by any [`ObjectStore`].
pub struct ObjectStoreCheckpointStore {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
}

impl ObjectStoreCheckpointStore {
    /// Wrap an existing object store. Objects are written below `prefix`.
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl AsRef<str>) -> Self {
        Self {
            store,
            prefix: ObjectPath::from(prefix.as_ref()),
        }
    }

    /// Build a store from a `checkpoint_location` value.
    ///
    /// Supported forms:
    /// - `memory://` (process-local, for tests and dry runs)
    /// - `file:///var/lib/bridge` or a plain path (`/var/lib/bridge`, `./ckpt`)
    /// - `gs://bucket/prefix` (credentials from the environment)
    pub fn from_location(location: &str) -> Result<Self, CheckpointError> {
        let location = location.trim();
        if location.starts_with("memory://") {
            let prefix = location.trim_start_matches("memory://");
            return Ok(Self::new(Arc::new(InMemory::new()), prefix));
        }

        if !location.contains("://") {
            return Self::local(PathBuf::from(location));
        }

        let url = Url::parse(location)
            .map_err(|e| CheckpointError::InvalidLocation(format!("{}: {}", location, e)))?;
        match url.scheme() {
            "file" => {
                let path = url.to_file_path().map_err(|_| {
                    CheckpointError::InvalidLocation(format!("{}: not a local path", location))
                })?;
                Self::local(path)
            }
            "gs" => {
                let bucket = url.host_str().ok_or_else(|| {
                    CheckpointError::InvalidLocation(format!("{}: missing bucket", location))
                })?;
                let store = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()
                    .map_err(|e| CheckpointError::InvalidLocation(e.to_string()))?;
                Ok(Self::new(Arc::new(store), url.path().trim_matches('/')))
            }
            other => Err(CheckpointError::InvalidLocation(format!(
                "unsupported scheme '{}' in {}",
                other, location
            ))),
        }
    }

    fn local(directory: PathBuf) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(&directory).map_err(|e| {
            CheckpointError::InvalidLocation(format!(
                "failed to create checkpoint directory {}: {}",
                directory.display(),
                e
            ))
        })?;
        let store = LocalFileSystem::new_with_prefix(&directory)
            .map_err(|e| CheckpointError::InvalidLocation(e.to_string()))?;
        Ok(Self::new(Arc::new(store), ""))
    }

    fn object_path(&self, tp: &TopicPartition) -> ObjectPath {
        self.prefix
            .child(tp.topic.as_str())
            .child(format!("{}.json", tp.partition))
    }

    /// Read the current entry together with the version needed for a conditional update.
    async fn read_entry(
        &self,
        tp: &TopicPartition,
    ) -> Result<Option<(CheckpointEntry, UpdateVersion)>, CheckpointError> {
        let path = self.object_path(tp);
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let data = result.bytes().await?;
        let entry: CheckpointEntry = serde_json::from_slice(&data)
            .map_err(|e| CheckpointError::Corrupt(format!("{}: {}", path, e)))?;

        if entry.topic != tp.topic || entry.partition != tp.partition {
            return Err(CheckpointError::Corrupt(format!(
                "{} holds checkpoint for {}/{}",
                path, entry.topic, entry.partition
            )));
        }
        Ok(Some((entry, version)))
    }
}

#[async_trait]
impl CheckpointStore for ObjectStoreCheckpointStore {
    async fn load(&self, tp: &TopicPartition) -> Result<Option<u64>, CheckpointError> {
        let entry = self.read_entry(tp).await?;
        Ok(entry.map(|(e, _)| e.offset))
    }

    async fn save(&self, tp: &TopicPartition, offset: u64) -> Result<(), CheckpointError> {
        let path = self.object_path(tp);
        let existing = self.read_entry(tp).await?;

        let mode = match existing {
            Some((current, _)) if current.offset > offset => {
                return Err(CheckpointError::Conflict(format!(
                    "stored offset {} for {} is ahead of {}",
                    current.offset, tp, offset
                )));
            }
            Some((current, _)) if current.offset == offset => {
                debug!(topic = %tp.topic, partition = tp.partition, offset, "Checkpoint unchanged");
                return Ok(());
            }
            Some((_, version)) if version.e_tag.is_some() || version.version.is_some() => {
                PutMode::Update(version)
            }
            Some(_) => PutMode::Overwrite,
            None => PutMode::Create,
        };

        let body = serde_json::to_vec(&CheckpointEntry::new(tp, offset))
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
        let body = Bytes::from(body);

        let opts = PutOptions {
            mode,
            ..Default::default()
        };
        match self.store.put_opts(&path, body.clone().into(), opts).await {
            Ok(_) => {}
            Err(object_store::Error::NotImplemented) => {
                warn!(
                    path = %path,
                    "Conditional put not supported by checkpoint backend, overwriting"
                );
                self.store.put(&path, body.into()).await?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!(topic = %tp.topic, partition = tp.partition, offset, "Checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(partition: u32) -> TopicPartition {
        TopicPartition::new("orders", partition)
    }

    fn memory_store() -> ObjectStoreCheckpointStore {
        ObjectStoreCheckpointStore::new(Arc::new(InMemory::new()), "checkpoints")
    }

    // ---------------------------------------------------------------
    // Load / save
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_load_absent_returns_none() {
        let store = memory_store();
        assert_eq!(store.load(&tp(0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = memory_store();
        store.save(&tp(0), 41).await.unwrap();
        assert_eq!(store.load(&tp(0)).await.unwrap(), Some(41));

        store.save(&tp(0), 99).await.unwrap();
        assert_eq!(store.load(&tp(0)).await.unwrap(), Some(99));
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let store = memory_store();
        store.save(&tp(0), 10).await.unwrap();
        store.save(&tp(1), 20).await.unwrap();
        assert_eq!(store.load(&tp(0)).await.unwrap(), Some(10));
        assert_eq!(store.load(&tp(1)).await.unwrap(), Some(20));
        assert_eq!(store.load(&tp(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_same_offset_is_idempotent() {
        let store = memory_store();
        store.save(&tp(0), 5).await.unwrap();
        store.save(&tp(0), 5).await.unwrap();
        assert_eq!(store.load(&tp(0)).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_object_layout() {
        let inner: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = ObjectStoreCheckpointStore::new(inner.clone(), "bridge");
        store.save(&tp(3), 7).await.unwrap();

        let data = inner
            .get(&ObjectPath::from("bridge/orders/3.json"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let entry: CheckpointEntry = serde_json::from_slice(&data).unwrap();
        assert_eq!(entry.topic, "orders");
        assert_eq!(entry.partition, 3);
        assert_eq!(entry.offset, 7);
        assert!(entry.updated_at_ms > 0);
    }

    // ---------------------------------------------------------------
    // Conflicts and corruption
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_regression_is_conflict() {
        let store = memory_store();
        store.save(&tp(0), 100).await.unwrap();
        let err = store.save(&tp(0), 50).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Conflict(_)));
        assert!(!err.is_retryable());
        assert_eq!(store.load(&tp(0)).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_corrupt_object_is_reported() {
        let inner: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        inner
            .put(
                &ObjectPath::from("orders/0.json"),
                Bytes::from_static(b"not json").into(),
            )
            .await
            .unwrap();
        let store = ObjectStoreCheckpointStore::new(inner, "");
        let err = store.load(&tp(0)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt(_)));
    }

    #[test]
    fn test_only_storage_unavailable_is_retryable() {
        assert!(CheckpointError::StorageUnavailable("x".into()).is_retryable());
        assert!(!CheckpointError::Conflict("x".into()).is_retryable());
        assert!(!CheckpointError::Corrupt("x".into()).is_retryable());
    }

    // ---------------------------------------------------------------
    // Locations
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_local_directory_location() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("ckpt");

        let store = ObjectStoreCheckpointStore::from_location(location.to_str().unwrap()).unwrap();
        store.save(&tp(2), 12).await.unwrap();
        assert!(location.join("orders").join("2.json").exists());

        // A fresh store over the same directory reads the persisted value.
        let reopened =
            ObjectStoreCheckpointStore::from_location(location.to_str().unwrap()).unwrap();
        assert_eq!(reopened.load(&tp(2)).await.unwrap(), Some(12));
        reopened.save(&tp(2), 13).await.unwrap();
        assert_eq!(store.load(&tp(2)).await.unwrap(), Some(13));
    }

    #[tokio::test]
    async fn test_file_url_location() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        let store = ObjectStoreCheckpointStore::from_location(&url).unwrap();
        store.save(&tp(0), 1).await.unwrap();
        assert_eq!(store.load(&tp(0)).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_memory_location() {
        let store = ObjectStoreCheckpointStore::from_location("memory://").unwrap();
        store.save(&tp(0), 3).await.unwrap();
        assert_eq!(store.load(&tp(0)).await.unwrap(), Some(3));
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = ObjectStoreCheckpointStore::from_location("ftp://host/dir").err().unwrap();
        assert!(matches!(err, CheckpointError::InvalidLocation(_)));
    }
}
