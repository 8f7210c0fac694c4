//! Filesystem Storage Backend
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/VERSION            stamp, JSON {"version": .., "stamped_at": ..}
//! <root>/entries/<sha256>   one file per entry
//! ```
//!
//! Every write lands in a uniquely named temp file that is renamed into
//! place, so a reader sees either the old file or the new one. Wipes rename
//! the whole `entries` directory aside before deleting it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::entry::CacheKey;
use super::migration::FormatVersion;
use super::storage::{StorageBackend, StorageCounters, StorageStats};
use crate::error::{Error, Result};

const STAMP_FILE: &str = "VERSION";
const ENTRIES_DIR: &str = "entries";
const TMP_SUFFIX: &str = "tmp";
const TRASH_PREFIX: &str = "entries.trash-";

/// On-disk stamp record
#[derive(Debug, Serialize, Deserialize)]
struct StampFile {
    version: FormatVersion,
    stamped_at: DateTime<Utc>,
}

/// Filesystem-backed storage
pub struct FsStorage {
    root: PathBuf,
    entries_dir: PathBuf,
    /// Uniquifier for temp and trash names
    sequence: AtomicU64,
    counters: StorageCounters,
}

impl FsStorage {
    /// Open (creating if needed) a storage location and sweep leftovers
    /// from interrupted writes or wipes.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let entries_dir = root.join(ENTRIES_DIR);
        tokio::fs::create_dir_all(&entries_dir)
            .await
            .map_err(|e| Error::storage("open", format!("{}: {}", entries_dir.display(), e)))?;

        let storage = Self {
            root,
            entries_dir,
            sequence: AtomicU64::new(0),
            counters: StorageCounters::default(),
        };
        storage.sweep_leftovers().await;
        Ok(storage)
    }

    /// Root directory of this location
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir.join(key.storage_name())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Write `data` to `path` via temp file + fsync + rename
    async fn write_atomic(&self, path: &Path, data: &[u8], operation: &'static str) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Internal(format!("invalid path {}", path.display())))?;
        let tmp = path.with_file_name(format!(
            "{}.{}.{}",
            file_name,
            self.next_sequence(),
            TMP_SUFFIX
        ));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::storage(operation, e));
        }
        Ok(())
    }

    /// Remove temp files and trash directories left by a crash
    async fn sweep_leftovers(&self) {
        let tmp_suffix = format!(".{}", TMP_SUFFIX);

        if let Ok(mut dir) = tokio::fs::read_dir(&self.entries_dir).await {
            while let Ok(Some(item)) = dir.next_entry().await {
                if item.file_name().to_string_lossy().ends_with(&tmp_suffix) {
                    let _ = tokio::fs::remove_file(item.path()).await;
                }
            }
        }

        if let Ok(mut dir) = tokio::fs::read_dir(&self.root).await {
            while let Ok(Some(item)) = dir.next_entry().await {
                let name = item.file_name().to_string_lossy().into_owned();
                if name.starts_with(TRASH_PREFIX) {
                    debug!(path = %item.path().display(), "removing leftover trash directory");
                    let _ = tokio::fs::remove_dir_all(item.path()).await;
                } else if name.ends_with(&tmp_suffix) {
                    let _ = tokio::fs::remove_file(item.path()).await;
                }
            }
        }
    }

    async fn count_entries(&self) -> u64 {
        let mut count = 0;
        if let Ok(mut dir) = tokio::fs::read_dir(&self.entries_dir).await {
            while let Ok(Some(_)) = dir.next_entry().await {
                count += 1;
            }
        }
        count
    }

    /// Number of entry files currently stored
    pub async fn entry_count(&self) -> u64 {
        self.count_entries().await
    }
}

#[async_trait]
impl StorageBackend for FsStorage {
    async fn read_version_stamp(&self) -> Result<Option<FormatVersion>> {
        let path = self.root.join(STAMP_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let stamp: StampFile = serde_json::from_slice(&raw)
                    .map_err(|e| Error::storage("read_version_stamp", e))?;
                Ok(Some(stamp.version))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage("read_version_stamp", e)),
        }
    }

    async fn write_version_stamp(&self, version: &FormatVersion) -> Result<()> {
        self.counters.stamp_writes.fetch_add(1, Ordering::Relaxed);
        let stamp = StampFile {
            version: version.clone(),
            stamped_at: Utc::now(),
        };
        let raw = serde_json::to_vec_pretty(&stamp)?;
        self.write_atomic(&self.root.join(STAMP_FILE), &raw, "write_version_stamp")
            .await
    }

    async fn read_entry(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::read(self.entry_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage("read_entry", e)),
        }
    }

    async fn write_entry(&self, key: &CacheKey, payload: Bytes) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.write_atomic(&self.entry_path(key), &payload, "write_entry")
            .await
    }

    async fn remove_entry(&self, key: &CacheKey) -> Result<bool> {
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage("remove_entry", e)),
        }
    }

    async fn wipe_all(&self) -> Result<()> {
        self.counters.wipes.fetch_add(1, Ordering::Relaxed);
        let trash = self
            .root
            .join(format!("{}{}", TRASH_PREFIX, self.next_sequence()));

        match tokio::fs::rename(&self.entries_dir, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::storage("wipe_all", e)),
        }
        tokio::fs::create_dir_all(&self.entries_dir)
            .await
            .map_err(|e| Error::storage("wipe_all", e))?;

        if let Err(e) = tokio::fs::remove_dir_all(&trash).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                // Swept on next open
                warn!(path = %trash.display(), error = %e, "failed to delete wiped entries");
            }
        }
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        // Entry count requires a directory scan; see `entry_count`
        self.counters.snapshot(0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, FsStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_fresh_location_has_no_stamp() {
        let (_dir, storage) = open_temp().await;
        assert!(storage.read_version_stamp().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stamp_roundtrip_is_json() {
        let (dir, storage) = open_temp().await;
        storage
            .write_version_stamp(&FormatVersion::new("3"))
            .await
            .unwrap();

        assert_eq!(
            storage.read_version_stamp().await.unwrap(),
            Some(FormatVersion::new("3"))
        );

        let raw = std::fs::read_to_string(dir.path().join(STAMP_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], "3");
        assert!(value["stamped_at"].is_string());
    }

    #[tokio::test]
    async fn test_corrupt_stamp_is_storage_error() {
        let (dir, storage) = open_temp().await;
        std::fs::write(dir.path().join(STAMP_FILE), b"not json").unwrap();

        let err = storage.read_version_stamp().await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn test_entry_lifecycle() {
        let (_dir, storage) = open_temp().await;
        let key = CacheKey::new("images/cat.png");

        assert!(storage.read_entry(&key).await.unwrap().is_none());
        storage
            .write_entry(&key, Bytes::from_static(b"pixels"))
            .await
            .unwrap();
        assert_eq!(
            storage.read_entry(&key).await.unwrap(),
            Some(Bytes::from_static(b"pixels"))
        );

        storage
            .write_entry(&key, Bytes::from_static(b"new pixels"))
            .await
            .unwrap();
        assert_eq!(
            storage.read_entry(&key).await.unwrap(),
            Some(Bytes::from_static(b"new pixels"))
        );

        assert!(storage.remove_entry(&key).await.unwrap());
        assert!(!storage.remove_entry(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_wipe_all_removes_entries_keeps_stamp() {
        let (_dir, storage) = open_temp().await;
        storage
            .write_version_stamp(&FormatVersion::new("1"))
            .await
            .unwrap();
        for i in 0..5 {
            storage
                .write_entry(&CacheKey::new(format!("k{}", i)), Bytes::from_static(b"v"))
                .await
                .unwrap();
        }
        assert_eq!(storage.entry_count().await, 5);

        storage.wipe_all().await.unwrap();
        assert_eq!(storage.entry_count().await, 0);
        assert_eq!(
            storage.read_version_stamp().await.unwrap(),
            Some(FormatVersion::new("1"))
        );

        // Location stays writable
        storage
            .write_entry(&CacheKey::new("after"), Bytes::from_static(b"v"))
            .await
            .unwrap();
        assert_eq!(storage.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_reopen_sweeps_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FsStorage::open(dir.path()).await.unwrap();
            storage
                .write_entry(&CacheKey::new("kept"), Bytes::from_static(b"v"))
                .await
                .unwrap();
        }
        std::fs::write(dir.path().join(ENTRIES_DIR).join("abc.7.tmp"), b"partial").unwrap();
        std::fs::create_dir_all(dir.path().join(format!("{}9", TRASH_PREFIX))).unwrap();

        let storage = FsStorage::open(dir.path()).await.unwrap();
        assert_eq!(storage.entry_count().await, 1);
        assert!(!dir.path().join(format!("{}9", TRASH_PREFIX)).exists());
        assert!(storage
            .read_entry(&CacheKey::new("kept"))
            .await
            .unwrap()
            .is_some());
    }
}
