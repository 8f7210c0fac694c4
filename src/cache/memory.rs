//! Memory Tier - bounded in-process cache
//!
//! Sharded map with cost-based capacity. Eviction starts when utilization
//! reaches the high watermark and stops at the low watermark; which entries
//! go first is decided by the configured [`EvictionStrategy`].
//!
//! Nothing in this tier performs I/O or awaits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::entry::{now_secs, CacheEntry, CacheKey};
use super::eviction::{EvictionPolicy, EvictionStrategy};
use super::shard::ShardedMap;
use super::{DEFAULT_MEMORY_CAPACITY, DEFAULT_SHARD_COUNT};

/// Memory tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum capacity in cost units (bytes unless a cost hook is set)
    pub capacity: u64,
    /// High watermark fraction (trigger eviction)
    pub high_watermark: f64,
    /// Low watermark fraction (stop eviction)
    pub low_watermark: f64,
    /// Maximum entries evicted per pass
    pub eviction_batch_size: usize,
    /// Number of shards (rounded up to a power of two)
    pub shard_count: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
            high_watermark: 0.90,
            low_watermark: 0.80,
            eviction_batch_size: 1000,
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

/// Result of a memory tier insert
#[derive(Debug, Default)]
pub struct PutOutcome {
    /// False when the entry alone exceeds capacity
    pub stored: bool,
    /// Entries evicted to make room, for hook notification by the caller
    pub evicted: Vec<(CacheKey, CacheEntry)>,
}

/// Memory tier - sharded hot cache
pub struct MemoryTier {
    storage: ShardedMap<CacheEntry>,
    config: MemoryConfig,
    strategy: Arc<dyn EvictionStrategy>,
    /// Sum of entry costs
    current_cost: AtomicU64,
    /// Held by the thread running an eviction pass
    eviction_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryTier {
    /// Create a memory tier with the default LRU-K policy
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_strategy(config, Arc::new(EvictionPolicy::default()))
    }

    /// Create a memory tier with a custom eviction strategy
    pub fn with_strategy(config: MemoryConfig, strategy: Arc<dyn EvictionStrategy>) -> Self {
        Self {
            storage: ShardedMap::new(config.shard_count),
            config,
            strategy,
            current_cost: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get an entry, recording the access
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.storage.get(key) {
            Some(entry) => {
                entry.record_access();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace an entry.
    ///
    /// The inserted key is never chosen as an eviction victim by the same
    /// call, so a successful put is immediately readable.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) -> PutOutcome {
        let cost = entry.cost();
        if cost > self.config.capacity {
            // A rejected replacement must not leave the old value readable
            self.remove(&key);
            return PutOutcome::default();
        }

        match self.storage.insert(key.clone(), entry) {
            Some(old) => self.replace_cost(old.cost(), cost),
            None => {
                self.current_cost.fetch_add(cost, Ordering::Relaxed);
            }
        }

        let evicted = if self.utilization() >= self.config.high_watermark {
            self.evict(&key)
        } else {
            Vec::new()
        };

        PutOutcome {
            stored: true,
            evicted,
        }
    }

    fn replace_cost(&self, old: u64, new: u64) {
        if new > old {
            self.current_cost.fetch_add(new - old, Ordering::Relaxed);
        } else {
            self.current_cost.fetch_sub(old - new, Ordering::Relaxed);
        }
    }

    /// Remove an entry
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.storage.remove(key)?;
        self.current_cost
            .fetch_sub(removed.cost(), Ordering::Relaxed);
        Some(removed)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.storage.contains_key(key)
    }

    /// Evict entries until the low watermark is reached
    fn evict(&self, protected: &CacheKey) -> Vec<(CacheKey, CacheEntry)> {
        // One evictor at a time; concurrent writers skip the pass
        let Some(_guard) = self.eviction_lock.try_lock() else {
            return Vec::new();
        };

        let now = now_secs();
        let mut candidates: Vec<(CacheKey, f64)> = Vec::with_capacity(self.storage.len());
        for i in 0..self.storage.shard_count() {
            for (key, entry) in self.storage.shard(i).entries() {
                if &key != protected {
                    let score = self.strategy.score(&entry, now);
                    candidates.push((key, score));
                }
            }
        }

        // Highest score first
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = Vec::new();
        for (key, _) in candidates {
            if self.utilization() <= self.config.low_watermark
                || evicted.len() >= self.config.eviction_batch_size
            {
                break;
            }
            if let Some(entry) = self.remove(&key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted.push((key, entry));
            }
        }

        tracing::debug!(
            strategy = self.strategy.name(),
            evicted = evicted.len(),
            utilization = self.utilization(),
            "memory tier eviction pass"
        );
        evicted
    }

    /// Drop every entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let dropped = self.storage.clear();
        self.current_cost.store(0, Ordering::Relaxed);
        dropped
    }

    /// Current total cost
    pub fn size(&self) -> u64 {
        self.current_cost.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Utilization fraction (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        if self.config.capacity == 0 {
            return 1.0;
        }
        self.size() as f64 / self.config.capacity as f64
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            size: self.size(),
            capacity: self.capacity(),
            entries: self.len(),
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            utilization: self.utilization(),
        }
    }
}

/// Memory tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub size: u64,
    pub capacity: u64,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub utilization: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn make_entry(data: &[u8]) -> CacheEntry {
        CacheEntry::new(Bytes::copy_from_slice(data))
    }

    fn small_tier(capacity: u64) -> MemoryTier {
        MemoryTier::new(MemoryConfig {
            capacity,
            high_watermark: 0.80,
            low_watermark: 0.50,
            eviction_batch_size: 100,
            shard_count: 8,
        })
    }

    #[test]
    fn test_put_get() {
        let tier = MemoryTier::new(MemoryConfig::default());
        let key = CacheKey::new("object.txt");

        assert!(tier.put(key.clone(), make_entry(b"Hello, World!")).stored);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size(), 13);
        assert_eq!(tier.get(&key).unwrap().data().as_ref(), b"Hello, World!");
        assert_eq!(tier.hits(), 1);
    }

    #[test]
    fn test_miss_tracking() {
        let tier = MemoryTier::new(MemoryConfig::default());
        assert!(tier.get(&CacheKey::new("nope")).is_none());
        assert_eq!(tier.misses(), 1);
        assert_eq!(tier.hits(), 0);
    }

    #[test]
    fn test_replace_adjusts_cost() {
        let tier = MemoryTier::new(MemoryConfig::default());
        let key = CacheKey::new("object");

        tier.put(key.clone(), make_entry(b"original"));
        assert_eq!(tier.size(), 8);

        tier.put(key.clone(), make_entry(b"replaced content"));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size(), 16);

        tier.put(key.clone(), make_entry(b"tiny"));
        assert_eq!(tier.size(), 4);
    }

    #[test]
    fn test_remove() {
        let tier = MemoryTier::new(MemoryConfig::default());
        let key = CacheKey::new("object");
        tier.put(key.clone(), make_entry(b"data"));

        assert!(tier.remove(&key).is_some());
        assert_eq!(tier.size(), 0);
        assert!(tier.remove(&key).is_none());
        assert!(!tier.contains(&key));
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let tier = small_tier(100);
        let outcome = tier.put(CacheKey::new("huge"), make_entry(&[0u8; 101]));
        assert!(!outcome.stored);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_oversized_replacement_drops_old_value() {
        let tier = small_tier(100);
        let key = CacheKey::new("k");
        tier.put(key.clone(), make_entry(&[1u8; 10]));

        let outcome = tier.put(key.clone(), make_entry(&[2u8; 101]));
        assert!(!outcome.stored);
        assert!(!tier.contains(&key));
        assert_eq!(tier.size(), 0);
    }

    #[test]
    fn test_eviction_reports_victims() {
        let tier = small_tier(1000);

        let mut evicted = 0;
        for i in 0..20 {
            let outcome = tier.put(CacheKey::new(format!("object-{}", i)), make_entry(&[i as u8; 100]));
            assert!(outcome.stored);
            evicted += outcome.evicted.len();
        }

        assert!(evicted > 0);
        assert_eq!(tier.evictions() as usize, evicted);
        assert!(tier.size() < 1000);
    }

    #[test]
    fn test_latest_put_survives_eviction() {
        let tier = small_tier(1000);
        for i in 0..50 {
            let key = CacheKey::new(format!("object-{}", i));
            tier.put(key.clone(), make_entry(&[0u8; 100]));
            assert!(tier.contains(&key), "just-written key {} was evicted", i);
        }
    }

    #[test]
    fn test_clear() {
        let tier = MemoryTier::new(MemoryConfig::default());
        for i in 0..10 {
            tier.put(CacheKey::new(format!("k{}", i)), make_entry(&[1u8; 10]));
        }
        assert_eq!(tier.clear(), 10);
        assert!(tier.is_empty());
        assert_eq!(tier.size(), 0);
    }

    #[test]
    fn test_custom_strategy_is_used() {
        struct EvictByName;
        impl EvictionStrategy for EvictByName {
            fn name(&self) -> &str {
                "by-name"
            }
            fn score(&self, entry: &CacheEntry, _now: u64) -> f64 {
                entry.data()[0] as f64
            }
        }

        let config = MemoryConfig {
            capacity: 400,
            high_watermark: 0.75,
            low_watermark: 0.50,
            eviction_batch_size: 10,
            shard_count: 4,
        };
        let tier = MemoryTier::with_strategy(config, Arc::new(EvictByName));

        tier.put(CacheKey::new("a"), make_entry(&[1u8; 100]));
        tier.put(CacheKey::new("b"), make_entry(&[9u8; 100]));
        let outcome = tier.put(CacheKey::new("c"), make_entry(&[5u8; 100]));

        // 300/400 hits the high watermark; "b" scores highest
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].0, CacheKey::new("b"));
        assert!(tier.contains(&CacheKey::new("a")));
    }

    #[test]
    fn test_stats() {
        let tier = MemoryTier::new(MemoryConfig {
            capacity: 1000,
            ..Default::default()
        });
        let key = CacheKey::new("object");
        tier.put(key.clone(), make_entry(&[0u8; 500]));
        tier.get(&key);
        tier.get(&CacheKey::new("missing"));

        let stats = tier.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.utilization - 0.5).abs() < 0.01);
    }
}
