//! Sharded Map
//!
//! Concurrent map keyed by [`CacheKey`], split into power-of-two shards that
//! each carry their own `RwLock`. Shard selection reuses the key's
//! pre-computed hash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::entry::CacheKey;

/// Single shard: a locked hashmap plus an entry counter
pub struct Shard<V> {
    map: RwLock<HashMap<CacheKey, V>>,
    count: AtomicU64,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            count: AtomicU64::new(0),
        }
    }
}

impl<V: Clone> Shard<V> {
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<(CacheKey, V)> {
        let guard = self.map.read();
        guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Map split into `shard_count` independently locked shards
pub struct ShardedMap<V> {
    shards: Box<[Shard<V>]>,
}

impl<V: Clone> ShardedMap<V> {
    /// Create a map; `shard_count` is rounded up to a power of two
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        let shards: Vec<Shard<V>> = (0..count).map(|_| Shard::default()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard_for(&self, key: &CacheKey) -> &Shard<V> {
        &self.shards[key.shard_index(self.shards.len())]
    }

    /// Shard by index (for iteration)
    pub fn shard(&self, index: usize) -> &Shard<V> {
        &self.shards[index % self.shards.len()]
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.shard_for(key).map.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.shard_for(key).map.read().contains_key(key)
    }

    /// Insert, returning the replaced value
    pub fn insert(&self, key: CacheKey, value: V) -> Option<V> {
        let shard = self.shard_for(&key);
        let old = shard.map.write().insert(key, value);
        if old.is_none() {
            shard.count.fetch_add(1, Ordering::Relaxed);
        }
        old
    }

    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        let shard = self.shard_for(key);
        let removed = shard.map.write().remove(key);
        if removed.is_some() {
            shard.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        for shard in self.shards.iter() {
            let mut guard = shard.map.write();
            dropped += guard.len();
            guard.clear();
            shard.count.store(0, Ordering::Relaxed);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }
}

// =============================================================================
// Tests
// =============================================================================
