//! Caller Hooks
//!
//! Every hook is optional; an absent hook falls back to the built-in
//! behavior. Hooks are plain synchronous closures shared behind `Arc`.
//!
//! ```
//! use tiercache::cache::{CacheHooks, MigrationHooks};
//!
//! let hooks = CacheHooks::new()
//!     .with_migration(MigrationHooks::new().should_use_disk_version(|v| v.as_str() == "1"))
//!     .memory_cost(|_key, payload| payload.len() as u64 + 64)
//!     .should_persist(|key, _payload| !key.as_str().starts_with("tmp/"));
//! # let _ = hooks;
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::entry::{CacheEntry, CacheKey};
use super::migration::FormatVersion;

/// Error type returned by a migration hook
pub type MigrationError = Box<dyn std::error::Error + Send + Sync>;

pub type ShouldUseDiskVersionFn = Arc<dyn Fn(&FormatVersion) -> bool + Send + Sync>;
pub type MigrateFromDiskVersionFn =
    Arc<dyn Fn(&FormatVersion) -> Result<(), MigrationError> + Send + Sync>;
pub type CostFn = Arc<dyn Fn(&CacheKey, &Bytes) -> u64 + Send + Sync>;
pub type OnEvictFn = Arc<dyn Fn(&CacheKey, &CacheEntry) + Send + Sync>;
pub type ShouldPersistFn = Arc<dyn Fn(&CacheKey, &Bytes) -> bool + Send + Sync>;
pub type OnStorageErrorFn = Arc<dyn Fn(&StorageFault) + Send + Sync>;

// =============================================================================
// Migration
// =============================================================================

/// Hooks consulted when the stored format version differs from the current
#[derive(Clone, Default)]
pub struct MigrationHooks {
    /// Returns true if entries stamped with the given version can be used as-is
    pub should_use_disk_version: Option<ShouldUseDiskVersionFn>,
    /// Converts the stored entries in place; an error discards the tier
    pub migrate_from_disk_version: Option<MigrateFromDiskVersionFn>,
}

impl MigrationHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_use_disk_version<F>(mut self, f: F) -> Self
    where
        F: Fn(&FormatVersion) -> bool + Send + Sync + 'static,
    {
        self.should_use_disk_version = Some(Arc::new(f));
        self
    }

    pub fn migrate_from_disk_version<F>(mut self, f: F) -> Self
    where
        F: Fn(&FormatVersion) -> Result<(), MigrationError> + Send + Sync + 'static,
    {
        self.migrate_from_disk_version = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for MigrationHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationHooks")
            .field("should_use_disk_version", &self.should_use_disk_version.is_some())
            .field("migrate_from_disk_version", &self.migrate_from_disk_version.is_some())
            .finish()
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Hooks for the memory tier
#[derive(Clone, Default)]
pub struct MemoryHooks {
    /// Capacity units charged for an entry (default: payload length)
    pub cost: Option<CostFn>,
    /// Called after an entry is evicted, outside tier locks
    pub on_evict: Option<OnEvictFn>,
}

impl MemoryHooks {
    pub(crate) fn cost_of(&self, key: &CacheKey, payload: &Bytes) -> u64 {
        match &self.cost {
            Some(cost) => cost(key, payload),
            None => payload.len() as u64,
        }
    }

    pub(crate) fn evicted(&self, evicted: &[(CacheKey, CacheEntry)]) {
        if let Some(on_evict) = &self.on_evict {
            for (key, entry) in evicted {
                on_evict(key, entry);
            }
        }
    }
}

impl fmt::Debug for MemoryHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHooks")
            .field("cost", &self.cost.is_some())
            .field("on_evict", &self.on_evict.is_some())
            .finish()
    }
}

// =============================================================================
// Disk
// =============================================================================

/// A disk tier failure that did not reach the caller as an error
#[derive(Debug, Clone)]
pub struct StorageFault {
    /// Operation that failed (`get`, `put`, `remove`, `wipe`)
    pub operation: &'static str,
    /// Affected key, if the operation had one
    pub key: Option<CacheKey>,
    pub error: String,
}

impl fmt::Display for StorageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "disk {} failed for {}: {}", self.operation, key, self.error),
            None => write!(f, "disk {} failed: {}", self.operation, self.error),
        }
    }
}

/// Hooks for the disk tier
#[derive(Clone, Default)]
pub struct DiskHooks {
    /// Returns false to keep a value memory-only
    pub should_persist: Option<ShouldPersistFn>,
    /// Diagnostic callback for swallowed disk failures
    pub on_storage_error: Option<OnStorageErrorFn>,
}

impl DiskHooks {
    pub(crate) fn persists(&self, key: &CacheKey, payload: &Bytes) -> bool {
        self.should_persist
            .as_ref()
            .map_or(true, |should_persist| should_persist(key, payload))
    }

    pub(crate) fn report(&self, fault: &StorageFault) {
        if let Some(on_storage_error) = &self.on_storage_error {
            on_storage_error(fault);
        }
    }
}

impl fmt::Debug for DiskHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskHooks")
            .field("should_persist", &self.should_persist.is_some())
            .field("on_storage_error", &self.on_storage_error.is_some())
            .finish()
    }
}

// =============================================================================
// Composite
// =============================================================================

/// All hook sets for a [`Cache`](super::Cache)
#[derive(Clone, Default, Debug)]
pub struct CacheHooks {
    pub migration: MigrationHooks,
    pub memory: MemoryHooks,
    pub disk: DiskHooks,
}

impl CacheHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_migration(mut self, migration: MigrationHooks) -> Self {
        self.migration = migration;
        self
    }

    pub fn memory_cost<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheKey, &Bytes) -> u64 + Send + Sync + 'static,
    {
        self.memory.cost = Some(Arc::new(f));
        self
    }

    pub fn on_evict<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheKey, &CacheEntry) + Send + Sync + 'static,
    {
        self.memory.on_evict = Some(Arc::new(f));
        self
    }

    pub fn should_persist<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheKey, &Bytes) -> bool + Send + Sync + 'static,
    {
        self.disk.should_persist = Some(Arc::new(f));
        self
    }

    pub fn on_storage_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&StorageFault) + Send + Sync + 'static,
    {
        self.disk.on_storage_error = Some(Arc::new(f));
        self
    }
}
