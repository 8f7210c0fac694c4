//! Memory Eviction Strategies
//!
//! The memory tier asks a strategy to score entries and evicts the highest
//! scores first. `EvictionPolicy` is the built-in weighted strategy.

use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;

/// Pluggable eviction strategy for the memory tier
pub trait EvictionStrategy: Send + Sync {
    /// Human-readable name, used in logs
    fn name(&self) -> &str;

    /// Eviction score for an entry at time `now` (epoch seconds).
    ///
    /// Higher = more likely to evict.
    fn score(&self, entry: &CacheEntry, now: u64) -> f64;
}

/// Weighted recency / frequency / size eviction policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionPolicy {
    /// Name of the policy
    pub name: String,
    /// Weight for recency in eviction score (0.0 - 1.0)
    pub recency_weight: f64,
    /// Weight for frequency in eviction score (0.0 - 1.0)
    pub frequency_weight: f64,
    /// Weight for size in eviction score (0.0 - 1.0)
    pub size_weight: f64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::lru_k()
    }
}

impl EvictionPolicy {
    /// LRU-K eviction policy (default)
    ///
    /// Balances recency and frequency, penalizing infrequently accessed items.
    pub fn lru_k() -> Self {
        Self::weighted("LRU-K", 0.5, 0.5, 0.0)
    }

    /// Pure LRU: evicts least recently accessed items first.
    pub fn lru() -> Self {
        Self::weighted("LRU", 1.0, 0.0, 0.0)
    }

    /// LFU: evicts least frequently accessed items first.
    pub fn lfu() -> Self {
        Self::weighted("LFU", 0.0, 1.0, 0.0)
    }

    /// Size-aware: prefers evicting larger items to free space faster.
    pub fn size_aware() -> Self {
        Self::weighted("Size-Aware", 0.3, 0.3, 0.4)
    }

    fn weighted(name: &str, recency: f64, frequency: f64, size: f64) -> Self {
        Self {
            name: name.to_string(),
            recency_weight: recency,
            frequency_weight: frequency,
            size_weight: size,
        }
    }

    /// Calculate eviction score from raw inputs
    pub fn calculate_score(&self, idle_secs: f64, access_count: u32, size_bytes: u64) -> f64 {
        let age_score = idle_secs / 3600.0;
        let freq_score = 1.0 / (access_count as f64 + 1.0);
        // log2 of zero is -inf
        let size_score = (size_bytes.max(1) as f64).log2() / 30.0;

        self.recency_weight * age_score
            + self.frequency_weight * freq_score
            + self.size_weight * size_score
    }
}

impl EvictionStrategy for EvictionPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, entry: &CacheEntry, now: u64) -> f64 {
        let meta = &entry.metadata;
        self.calculate_score(
            meta.idle_secs(now) as f64,
            meta.access_count(),
            meta.cost(),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
