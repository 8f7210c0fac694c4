//! Cache Entry Types
//!
//! Keys are shared by both tiers; entries are owned by the tier holding them.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Current wall-clock time in epoch seconds
#[inline]
pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Cache key - opaque, stable identifier used by both tiers
#[derive(Clone, Debug, Eq)]
pub struct CacheKey {
    /// Pre-computed hash for sharding and fast comparison
    hash: u64,
    /// Logical name or content digest
    name: Arc<str>,
}

impl CacheKey {
    /// Create a key from a logical name
    pub fn new(name: impl AsRef<str>) -> Self {
        let name: Arc<str> = Arc::from(name.as_ref());
        Self {
            hash: Self::fx_hash(name.as_bytes()),
            name,
        }
    }

    /// Create a key from the SHA-256 digest of some content
    pub fn from_content(content: &[u8]) -> Self {
        Self::new(hex::encode(Sha256::digest(content)))
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Stripe or shard index for this key; `count` must be a power of two
    #[inline]
    pub fn shard_index(&self, count: usize) -> usize {
        (self.hash as usize) & (count - 1)
    }

    /// The key as given by the caller
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Pre-computed 64-bit hash
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// Filesystem-safe, fixed-length name for storage backends
    pub fn storage_name(&self) -> String {
        hex::encode(Sha256::digest(self.name.as_bytes()))
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.name == other.name
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Entry metadata: size, eviction cost, and access tracking
#[derive(Debug)]
pub struct EntryMetadata {
    /// Payload size in bytes
    size: u64,
    /// Cost charged against memory capacity
    cost: u64,
    /// Creation timestamp (epoch seconds)
    created_at: u64,
    /// Last access timestamp (epoch seconds)
    last_access: AtomicU64,
    /// Access count for frequency-based eviction
    access_count: AtomicU32,
}

impl EntryMetadata {
    /// Create new entry metadata
    pub fn new(size: u64, cost: u64) -> Self {
        let now = now_secs();
        Self {
            size,
            cost,
            created_at: now,
            last_access: AtomicU64::new(now),
            access_count: AtomicU32::new(1),
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Record an access and return the new count
    #[inline]
    pub fn record_access(&self) -> u32 {
        self.last_access.store(now_secs(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Last access time (epoch seconds)
    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Creation time (epoch seconds)
    #[inline]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Seconds since the last access, relative to `now`
    #[inline]
    pub fn idle_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access())
    }
}

impl Clone for EntryMetadata {
    fn clone(&self) -> Self {
        Self {
            size: self.size,
            cost: self.cost,
            created_at: self.created_at,
            last_access: AtomicU64::new(self.last_access()),
            access_count: AtomicU32::new(self.access_count()),
        }
    }
}

/// Cache entry containing payload and metadata
#[derive(Clone)]
pub struct CacheEntry {
    /// Entry metadata
    pub metadata: EntryMetadata,
    /// Opaque payload
    data: Bytes,
}

impl CacheEntry {
    /// Create an entry whose cost equals its size
    pub fn new(data: Bytes) -> Self {
        let size = data.len() as u64;
        Self::with_cost(data, size)
    }

    /// Create an entry with an explicit eviction cost
    pub fn with_cost(data: Bytes, cost: u64) -> Self {
        Self {
            metadata: EntryMetadata::new(data.len() as u64, cost),
            data,
        }
    }

    /// Payload (zero-copy)
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.metadata.size()
    }

    #[inline]
    pub fn cost(&self) -> u64 {
        self.metadata.cost()
    }

    #[inline]
    pub fn record_access(&self) -> u32 {
        self.metadata.record_access()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size", &self.metadata.size())
            .field("cost", &self.metadata.cost())
            .field("access_count", &self.metadata.access_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
