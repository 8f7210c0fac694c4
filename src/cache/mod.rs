//! Two-Tier Cache
//!
//! A bounded in-process memory tier in front of a persistent, versioned disk
//! tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Cache                                    │
//! │   get: memory → pending writes → disk → promote                       │
//! │   set: memory now, disk now (synchronous) or via write-behind worker  │
//! ├──────────────────────────────────┬───────────────────────────────────┤
//! │  MemoryTier                      │  DiskTier                         │
//! │  ┌────────────────────────────┐  │  ┌─────────────────────────────┐  │
//! │  │ ShardedMap<CacheEntry>     │  │  │ MigrationCoordinator (once) │  │
//! │  │ cost-based capacity        │  │  │ StorageBackend              │  │
//! │  │ EvictionStrategy           │  │  │  - FsStorage                │  │
//! │  └────────────────────────────┘  │  │  - InMemoryStorage          │  │
//! │                                  │  └─────────────────────────────┘  │
//! └──────────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! # Consistency
//!
//! - A read after a `set` on the same key returns that value, even if the
//!   memory tier evicted it before the disk write landed
//! - After `invalidate(k)` returns, no tier serves the old value
//! - Concurrent `set`s on one key leave exactly one of the values in both
//!   tiers
//! - The disk tier serves nothing until its format version is resolved

mod disk;
mod entry;
mod eviction;
mod facade;
mod fs;
mod hooks;
mod memory;
mod metrics;
mod migration;
mod shard;
mod storage;

#[cfg(test)]
mod proptest;

pub use disk::{DiskStats, DiskTier};
pub use entry::{CacheEntry, CacheKey, EntryMetadata};
pub use eviction::{EvictionPolicy, EvictionStrategy};
pub use facade::{Cache, CacheConfig, CacheHit, CacheTier, DiskConfig, WriteMode};
pub use fs::FsStorage;
pub use hooks::{
    CacheHooks, DiskHooks, MemoryHooks, MigrationError, MigrationHooks, StorageFault,
};
pub use memory::{MemoryConfig, MemoryStats, MemoryTier, PutOutcome};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use migration::{FormatVersion, MigrationCoordinator, MigrationDecision, MigrationOutcome};
pub use shard::{Shard, ShardedMap};
pub use storage::{InMemoryStorage, StorageBackend, StorageStats};

/// Default memory tier capacity (256MB of cost units)
pub const DEFAULT_MEMORY_CAPACITY: u64 = 256 * 1024 * 1024;

/// Default number of memory shards and facade key stripes
pub const DEFAULT_SHARD_COUNT: usize = 64;

/// Default bound of the write-behind queue
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 1024;

// =============================================================================
// Tests
// =============================================================================
