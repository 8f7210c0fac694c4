//! Shared test backends

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use tiercache::cache::{CacheKey, FormatVersion, InMemoryStorage, StorageBackend, StorageStats};
use tiercache::{Error, Result};

/// In-memory backend with switchable failures
#[derive(Default)]
pub struct FaultyStorage {
    pub inner: InMemoryStorage,
    pub fail_stamp_read: AtomicBool,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub fail_wipe: AtomicBool,
}

impl FaultyStorage {
    pub fn with_stamp(version: &str) -> Self {
        Self {
            inner: InMemoryStorage::with_stamp(version),
            ..Self::default()
        }
    }

    pub fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }
}

fn check(flag: &AtomicBool, operation: &'static str) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(Error::storage(operation, "injected I/O error"));
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for FaultyStorage {
    async fn read_version_stamp(&self) -> Result<Option<FormatVersion>> {
        check(&self.fail_stamp_read, "read_version_stamp")?;
        self.inner.read_version_stamp().await
    }

    async fn write_version_stamp(&self, version: &FormatVersion) -> Result<()> {
        self.inner.write_version_stamp(version).await
    }

    async fn read_entry(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        check(&self.fail_reads, "read_entry")?;
        self.inner.read_entry(key).await
    }

    async fn write_entry(&self, key: &CacheKey, payload: Bytes) -> Result<()> {
        check(&self.fail_writes, "write_entry")?;
        self.inner.write_entry(key, payload).await
    }

    async fn remove_entry(&self, key: &CacheKey) -> Result<bool> {
        check(&self.fail_writes, "remove_entry")?;
        self.inner.remove_entry(key).await
    }

    async fn wipe_all(&self) -> Result<()> {
        check(&self.fail_wipe, "wipe_all")?;
        self.inner.wipe_all().await
    }

    fn stats(&self) -> StorageStats {
        self.inner.stats()
    }
}
