//! Storage Backends for the Disk Tier
//!
//! The disk tier talks to persistent storage only through [`StorageBackend`].
//! Two implementations ship with the crate:
//!
//! - [`InMemoryStorage`] - DashMap-backed, for tests and ephemeral caches
//! - [`FsStorage`](super::fs::FsStorage) - one file per entry under a root
//!   directory

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use super::entry::CacheKey;
use super::migration::FormatVersion;
use crate::error::Result;

/// Persistent key/value store with a version stamp.
///
/// Every method is fallible; failures surface as `Error::Storage`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the stamped format version, `None` for a fresh location
    async fn read_version_stamp(&self) -> Result<Option<FormatVersion>>;

    /// Atomically replace the stamped format version
    async fn write_version_stamp(&self, version: &FormatVersion) -> Result<()>;

    /// Read an entry payload
    async fn read_entry(&self, key: &CacheKey) -> Result<Option<Bytes>>;

    /// Write or replace an entry payload; readers never observe a partial value
    async fn write_entry(&self, key: &CacheKey, payload: Bytes) -> Result<()>;

    /// Remove an entry, returning whether it existed
    async fn remove_entry(&self, key: &CacheKey) -> Result<bool>;

    /// Erase every entry at this location (the stamp is left in place)
    async fn wipe_all(&self) -> Result<()>;

    /// Operation counters
    fn stats(&self) -> StorageStats;
}

/// Backend operation counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    /// Entries currently stored, when the backend tracks it
    pub entry_count: u64,
    pub reads: u64,
    pub writes: u64,
    pub removes: u64,
    pub wipes: u64,
    pub stamp_writes: u64,
}

/// Shared atomic counters for backend implementations
#[derive(Debug, Default)]
pub(crate) struct StorageCounters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub removes: AtomicU64,
    pub wipes: AtomicU64,
    pub stamp_writes: AtomicU64,
}

impl StorageCounters {
    pub fn snapshot(&self, entry_count: u64) -> StorageStats {
        StorageStats {
            entry_count,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            wipes: self.wipes.load(Ordering::Relaxed),
            stamp_writes: self.stamp_writes.load(Ordering::Relaxed),
        }
    }
}

/// In-memory backend.
///
/// Uses DashMap for lock-free concurrent access instead of a single RwLock.
#[derive(Default)]
pub struct InMemoryStorage {
    entries: DashMap<CacheKey, Bytes>,
    stamp: RwLock<Option<FormatVersion>>,
    counters: StorageCounters,
}

impl InMemoryStorage {
    /// Create an empty, unstamped backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that already carries a stamp
    pub fn with_stamp(version: impl Into<FormatVersion>) -> Self {
        let storage = Self::default();
        *storage.stamp.write() = Some(version.into());
        storage
    }

    /// Current stamp without counting a read
    pub fn stamp(&self) -> Option<FormatVersion> {
        self.stamp.read().clone()
    }

    /// Seed an entry without counting a write
    pub fn insert_raw(&self, key: CacheKey, payload: impl Into<Bytes>) {
        self.entries.insert(key, payload.into());
    }

    /// Peek at an entry without counting a read
    pub fn peek(&self, key: &CacheKey) -> Option<Bytes> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn read_version_stamp(&self) -> Result<Option<FormatVersion>> {
        Ok(self.stamp.read().clone())
    }

    async fn write_version_stamp(&self, version: &FormatVersion) -> Result<()> {
        self.counters.stamp_writes.fetch_add(1, Ordering::Relaxed);
        *self.stamp.write() = Some(version.clone());
        Ok(())
    }

    async fn read_entry(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.peek(key))
    }

    async fn write_entry(&self, key: &CacheKey, payload: Bytes) -> Result<()> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key.clone(), payload);
        Ok(())
    }

    async fn remove_entry(&self, key: &CacheKey) -> Result<bool> {
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.remove(key).is_some())
    }

    async fn wipe_all(&self) -> Result<()> {
        self.counters.wipes.fetch_add(1, Ordering::Relaxed);
        self.entries.clear();
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        self.counters.snapshot(self.entries.len() as u64)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_entry_lifecycle() {
        let storage = InMemoryStorage::new();
        let key = CacheKey::new("blob");

        storage
            .write_entry(&key, Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(
            storage.read_entry(&key).await.unwrap(),
            Some(Bytes::from_static(b"data"))
        );

        assert!(storage.remove_entry(&key).await.unwrap());
        assert!(!storage.remove_entry(&key).await.unwrap());
        assert!(storage.read_entry(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_stamp() {
        let storage = InMemoryStorage::new();
        assert!(storage.read_version_stamp().await.unwrap().is_none());

        storage
            .write_version_stamp(&FormatVersion::new("2"))
            .await
            .unwrap();
        assert_eq!(
            storage.read_version_stamp().await.unwrap(),
            Some(FormatVersion::new("2"))
        );

        let seeded = InMemoryStorage::with_stamp("1");
        assert_eq!(seeded.stamp(), Some(FormatVersion::new("1")));
    }

    #[tokio::test]
    async fn test_wipe_keeps_stamp() {
        let storage = InMemoryStorage::with_stamp("1");
        storage.insert_raw(CacheKey::new("a"), &b"1"[..]);
        storage.insert_raw(CacheKey::new("b"), &b"2"[..]);

        storage.wipe_all().await.unwrap();
        assert!(storage.is_empty());
        assert_eq!(storage.stamp(), Some(FormatVersion::new("1")));
    }

    #[tokio::test]
    async fn test_in_memory_stats() {
        let storage = InMemoryStorage::new();
        let key = CacheKey::new("k");

        storage.write_entry(&key, Bytes::from_static(b"v")).await.unwrap();
        storage.read_entry(&key).await.unwrap();
        storage.read_entry(&key).await.unwrap();
        storage.remove_entry(&key).await.unwrap();

        let stats = storage.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.removes, 1);
    }
}
