//! Disk Tier
//!
//! Persistent tier over a [`StorageBackend`]. The first operation (or an
//! explicit [`DiskTier::initialize`]) runs the [`MigrationCoordinator`]
//! exactly once; nothing is read or written before that decision completes.
//!
//! # Locking
//!
//! - Writes and removes for the same key are serialized by striped async
//!   mutexes.
//! - A wipe takes the write side of an async `RwLock`; every other
//!   operation holds the read side, so no write interleaves with a wipe.
//!
//! If the location cannot be brought to a consistent state the tier is
//! marked unavailable and every operation fails with
//! [`Error::DiskUnavailable`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, RwLock, RwLockReadGuard};
use tracing::{debug, error, warn};

use super::entry::CacheKey;
use super::hooks::MigrationHooks;
use super::migration::{wipe_and_stamp, FormatVersion, MigrationCoordinator, MigrationOutcome};
use super::storage::{StorageBackend, StorageStats};
use crate::error::{Error, Result};

/// Number of per-key write lock stripes
const KEY_LOCK_STRIPES: usize = 64;

/// Shared handle on the spawned coordinator pass
type MigrationPass = Shared<BoxFuture<'static, TierState>>;

/// Result of the one-time initialization
#[derive(Debug, Clone)]
enum TierState {
    Ready(MigrationOutcome),
    Unavailable(String),
}

/// Persistent cache tier
pub struct DiskTier {
    backend: Arc<dyn StorageBackend>,
    current: FormatVersion,
    hooks: MigrationHooks,
    /// Resolved state of the coordinator pass
    gate: OnceCell<TierState>,
    pass: SyncMutex<Option<MigrationPass>>,
    /// Set when a runtime wipe fails; the location may hold stale entries
    fault: SyncMutex<Option<String>>,
    key_locks: Box<[Mutex<()>]>,
    wipe_gate: RwLock<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl DiskTier {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        current_version: impl Into<FormatVersion>,
        hooks: MigrationHooks,
    ) -> Self {
        let key_locks: Vec<Mutex<()>> = (0..KEY_LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Self {
            backend,
            current: current_version.into(),
            hooks,
            gate: OnceCell::new(),
            pass: SyncMutex::new(None),
            fault: SyncMutex::new(None),
            key_locks: key_locks.into_boxed_slice(),
            wipe_gate: RwLock::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Run (or wait for) the migration pass
    pub async fn initialize(&self) -> Result<MigrationOutcome> {
        match self.state().await {
            TierState::Ready(outcome) => Ok(outcome.clone()),
            TierState::Unavailable(reason) => Err(Error::DiskUnavailable(reason.clone())),
        }
    }

    async fn state(&self) -> &TierState {
        if let Some(state) = self.gate.get() {
            return state;
        }
        let state = self.pass().await;
        self.gate.get_or_init(|| async move { state }).await
    }

    /// The coordinator pass, started on first call.
    ///
    /// The pass runs in its own task; a caller that stops waiting does not
    /// cancel it, and later callers wait on the same pass.
    fn pass(&self) -> MigrationPass {
        self.pass
            .lock()
            .get_or_insert_with(|| {
                let coordinator = MigrationCoordinator::new(
                    Arc::clone(&self.backend),
                    self.current.clone(),
                    self.hooks.clone(),
                );
                let task = tokio::spawn(async move { coordinator.run().await });
                async move {
                    match task.await {
                        Ok(Ok(outcome)) => TierState::Ready(outcome),
                        Ok(Err(e)) => {
                            error!(error = %e, "Disk tier could not be initialized, serving from memory only");
                            TierState::Unavailable(e.to_string())
                        }
                        Err(e) => {
                            error!(error = %e, "Migration pass aborted, serving from memory only");
                            TierState::Unavailable(format!("migration pass aborted: {}", e))
                        }
                    }
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    /// Await initialization and take the read side of the wipe gate
    async fn serving(&self) -> Result<RwLockReadGuard<'_, ()>> {
        if let TierState::Unavailable(reason) = self.state().await {
            return Err(Error::DiskUnavailable(reason.clone()));
        }
        let guard = self.wipe_gate.read().await;
        // A wipe that failed while we waited leaves the location untrusted
        if let Some(reason) = self.fault() {
            return Err(Error::DiskUnavailable(reason));
        }
        Ok(guard)
    }

    fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Outcome of the migration pass, if it has run and succeeded
    pub fn outcome(&self) -> Option<MigrationOutcome> {
        match self.gate.get() {
            Some(TierState::Ready(outcome)) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// True once initialized and not failed
    pub fn is_available(&self) -> bool {
        matches!(self.gate.get(), Some(TierState::Ready(_))) && self.fault().is_none()
    }

    pub fn current_version(&self) -> &FormatVersion {
        &self.current
    }

    fn key_lock(&self, key: &CacheKey) -> &Mutex<()> {
        &self.key_locks[key.shard_index(self.key_locks.len())]
    }

    /// Read an entry
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let _wipe = self.serving().await?;

        let result = self.backend.read_entry(key).await;
        match &result {
            Ok(Some(_)) => self.hits.fetch_add(1, Ordering::Relaxed),
            Ok(None) => self.misses.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.errors.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Write an entry
    pub async fn put(&self, key: &CacheKey, payload: Bytes) -> Result<()> {
        self.put_if(key, payload, || true).await.map(|_| ())
    }

    /// Write an entry if `still_current` holds once the key lock is taken.
    ///
    /// Returns whether the write was applied.
    pub async fn put_if(
        &self,
        key: &CacheKey,
        payload: Bytes,
        still_current: impl FnOnce() -> bool,
    ) -> Result<bool> {
        let _wipe = self.serving().await?;
        let _key = self.key_lock(key).lock().await;

        if !still_current() {
            debug!(key = %key, "Skipping superseded disk write");
            return Ok(false);
        }
        self.backend
            .write_entry(key, payload)
            .await
            .inspect_err(|_| {
                self.errors.fetch_add(1, Ordering::Relaxed);
            })?;
        Ok(true)
    }

    /// Remove an entry, returning whether it existed
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.remove_if(key, || true).await?.unwrap_or(false))
    }

    /// Remove an entry if `still_current` holds once the key lock is taken.
    ///
    /// `None` means the removal was skipped.
    pub async fn remove_if(
        &self,
        key: &CacheKey,
        still_current: impl FnOnce() -> bool,
    ) -> Result<Option<bool>> {
        let _wipe = self.serving().await?;
        let _key = self.key_lock(key).lock().await;

        if !still_current() {
            return Ok(None);
        }
        let existed = self
            .backend
            .remove_entry(key)
            .await
            .inspect_err(|_| {
                self.errors.fetch_add(1, Ordering::Relaxed);
            })?;
        Ok(Some(existed))
    }

    /// Erase every entry and re-stamp the current version
    pub async fn wipe(&self) -> Result<()> {
        self.wipe_with(|| {}).await
    }

    /// Erase every entry, running `exclusive` around the wait for in-flight
    /// operations.
    ///
    /// `exclusive` runs twice: immediately, then again once no other disk
    /// operation is in flight, so anything that slipped in while the wipe
    /// was waiting is caught too. It runs even if the tier is unavailable.
    /// A failed wipe marks the tier unavailable, since entries that should
    /// be gone may remain.
    pub async fn wipe_with(&self, mut exclusive: impl FnMut()) -> Result<()> {
        exclusive();
        let state = self.state().await;
        let _wipe = self.wipe_gate.write().await;
        exclusive();

        if let TierState::Unavailable(reason) = state {
            return Err(Error::DiskUnavailable(reason.clone()));
        }
        if let Some(reason) = self.fault() {
            return Err(Error::DiskUnavailable(reason));
        }

        if let Err(e) = wipe_and_stamp(self.backend.as_ref(), &self.current).await {
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Disk wipe failed, disabling disk tier");
            *self.fault.lock() = Some(format!("wipe failed: {}", e));
            return Err(e);
        }
        debug!(version = %self.current, "Disk tier wiped");
        Ok(())
    }

    pub fn backend_stats(&self) -> StorageStats {
        self.backend.stats()
    }

    pub fn stats(&self) -> DiskStats {
        DiskStats {
            available: self.is_available(),
            format_version: self.current.clone(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            backend: self.backend_stats(),
        }
    }
}

/// Disk tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct DiskStats {
    pub available: bool,
    pub format_version: FormatVersion,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub backend: StorageStats,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::migration::MigrationDecision;
    use crate::cache::storage::InMemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Backend whose wipes fail on demand
    struct FlakyWipe {
        inner: InMemoryStorage,
        fail_wipe: AtomicBool,
    }

    #[async_trait]
    impl StorageBackend for FlakyWipe {
        async fn read_version_stamp(&self) -> Result<Option<FormatVersion>> {
            self.inner.read_version_stamp().await
        }
        async fn write_version_stamp(&self, version: &FormatVersion) -> Result<()> {
            self.inner.write_version_stamp(version).await
        }
        async fn read_entry(&self, key: &CacheKey) -> Result<Option<Bytes>> {
            self.inner.read_entry(key).await
        }
        async fn write_entry(&self, key: &CacheKey, payload: Bytes) -> Result<()> {
            self.inner.write_entry(key, payload).await
        }
        async fn remove_entry(&self, key: &CacheKey) -> Result<bool> {
            self.inner.remove_entry(key).await
        }
        async fn wipe_all(&self) -> Result<()> {
            if self.fail_wipe.load(Ordering::SeqCst) {
                return Err(Error::storage("wipe_all", "read-only filesystem"));
            }
            self.inner.wipe_all().await
        }
        fn stats(&self) -> StorageStats {
            self.inner.stats()
        }
    }

    #[tokio::test]
    async fn test_operations_wait_for_initialization() {
        let storage = Arc::new(InMemoryStorage::new());
        let tier = DiskTier::new(storage.clone(), "1", MigrationHooks::new());
        assert!(tier.outcome().is_none());
        assert!(!tier.is_available());

        let key = CacheKey::new("k");
        tier.put(&key, Bytes::from_static(b"v")).await.unwrap();

        // First operation ran the coordinator
        assert_eq!(storage.stamp(), Some(FormatVersion::new("1")));
        assert!(tier.is_available());
        assert_eq!(tier.outcome().unwrap().decision, MigrationDecision::Reuse);
        assert_eq!(tier.get(&key).await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let storage = Arc::new(InMemoryStorage::with_stamp("1"));
        let hooks = MigrationHooks::new().should_use_disk_version(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        });
        let tier = Arc::new(DiskTier::new(storage, "2", hooks));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tier = tier.clone();
                tokio::spawn(async move { tier.initialize().await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        tier.get(&CacheKey::new("x")).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guarded_writes_skip_when_superseded() {
        let storage = Arc::new(InMemoryStorage::new());
        let tier = DiskTier::new(storage.clone(), "1", MigrationHooks::new());
        let key = CacheKey::new("k");

        assert!(!tier.put_if(&key, Bytes::from_static(b"old"), || false).await.unwrap());
        assert!(storage.peek(&key).is_none());

        tier.put(&key, Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(tier.remove_if(&key, || false).await.unwrap(), None);
        assert_eq!(tier.remove_if(&key, || true).await.unwrap(), Some(true));
        assert!(!tier.remove(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_wipe_restamps_and_runs_exclusive_step() {
        let storage = Arc::new(InMemoryStorage::new());
        let tier = DiskTier::new(storage.clone(), "1", MigrationHooks::new());
        for i in 0..10 {
            tier.put(&CacheKey::new(format!("k{}", i)), Bytes::from_static(b"v"))
                .await
                .unwrap();
        }

        let mut runs = 0;
        tier.wipe_with(|| runs += 1).await.unwrap();

        assert_eq!(runs, 2);
        assert!(storage.is_empty());
        assert_eq!(storage.stamp(), Some(FormatVersion::new("1")));
        assert_eq!(storage.stats().wipes, 1);
    }

    #[tokio::test]
    async fn test_exclusive_step_runs_before_waiting_on_readers() {
        let storage = Arc::new(InMemoryStorage::new());
        let tier = Arc::new(DiskTier::new(storage.clone(), "1", MigrationHooks::new()));
        tier.put(&CacheKey::new("k"), Bytes::from_static(b"v")).await.unwrap();

        // An operation still in flight holds the read side
        let in_flight = tier.wipe_gate.read().await;
        let runs = Arc::new(AtomicU64::new(0));
        let wipe = tokio::spawn({
            let (tier, runs) = (tier.clone(), runs.clone());
            async move {
                tier.wipe_with(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while runs.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!wipe.is_finished());
        assert_eq!(storage.len(), 1);

        drop(in_flight);
        wipe.await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_failed_discard_makes_tier_unavailable() {
        let inner = InMemoryStorage::with_stamp("1");
        inner.insert_raw(CacheKey::new("stale"), &b"old"[..]);
        let backend = Arc::new(FlakyWipe {
            inner,
            fail_wipe: AtomicBool::new(true),
        });
        let tier = DiskTier::new(backend.clone(), "2", MigrationHooks::new());

        let err = tier.initialize().await.unwrap_err();
        assert!(matches!(err, Error::DiskUnavailable(_)));
        assert!(!tier.is_available());

        // Never fail open: the stale entry is not served
        assert!(tier.get(&CacheKey::new("stale")).await.is_err());
        assert!(tier
            .put(&CacheKey::new("new"), Bytes::from_static(b"v"))
            .await
            .is_err());
        assert_eq!(backend.inner.stats().reads, 0);
    }

    #[tokio::test]
    async fn test_failed_runtime_wipe_disables_tier() {
        let backend = Arc::new(FlakyWipe {
            inner: InMemoryStorage::new(),
            fail_wipe: AtomicBool::new(false),
        });
        let tier = DiskTier::new(backend.clone(), "1", MigrationHooks::new());
        let key = CacheKey::new("k");
        tier.put(&key, Bytes::from_static(b"v")).await.unwrap();

        backend.fail_wipe.store(true, Ordering::SeqCst);
        assert!(tier.wipe().await.is_err());

        assert!(!tier.is_available());
        assert!(matches!(tier.get(&key).await, Err(Error::DiskUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let tier = DiskTier::new(Arc::new(InMemoryStorage::new()), "1", MigrationHooks::new());
        let key = CacheKey::new("k");
        tier.put(&key, Bytes::from_static(b"v")).await.unwrap();

        tier.get(&key).await.unwrap();
        tier.get(&CacheKey::new("missing")).await.unwrap();

        let stats = tier.stats();
        assert!(stats.available);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.backend.writes, 1);
    }
}
