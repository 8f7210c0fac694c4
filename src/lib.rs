//! tiercache - Two-Tier Artifact Cache
//!
//! A bounded in-memory tier in front of a persistent disk tier whose on-disk
//! format is versioned. Lookups fall through memory to disk, disk hits are
//! promoted, and writes reach disk either synchronously or through a
//! write-behind worker.
//!
//! # Architecture
//!
//! ```text
//! Cache (facade) → MemoryTier (sharded, evicting)
//!               → DiskTier (StorageBackend, MigrationCoordinator)
//! ```
//!
//! When a disk location was written under a different format version, the
//! first access decides once whether its entries are reused, migrated by a
//! caller hook, or discarded.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiercache::cache::{Cache, CacheConfig, CacheHooks, CacheKey, FsStorage};
//!
//! # async fn run() -> tiercache::Result<()> {
//! let backend = Arc::new(FsStorage::open("/var/cache/artifacts").await?);
//! let cache = Cache::open(CacheConfig::default(), backend, CacheHooks::new()).await?;
//!
//! cache.set("build/output.o", &b"object code"[..]).await?;
//! let hit = cache.get(&CacheKey::new("build/output.o")).await;
//! assert!(hit.is_some());
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, storage backends, migration and the facade
//! - [`error`] - Error types

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{
    Cache, CacheConfig, CacheHooks, CacheKey, FormatVersion, FsStorage, InMemoryStorage,
    MigrationDecision, MigrationHooks, StorageBackend, WriteMode,
};
pub use error::{Error, Result};
