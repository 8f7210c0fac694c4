//! Property-Based Tests for the Cache Facade
//!
//! Drives random operation sequences against a `Cache` and a `HashMap`
//! model.
//!
//! # Test Properties
//!
//! 1. **Read-Your-Write**: every `get` agrees with the model, whatever the
//!    memory tier evicted
//! 2. **Durability**: after `flush`, the backend holds exactly the model
//! 3. **Capacity**: the memory tier never exceeds its capacity

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use super::entry::CacheKey;
use super::facade::{Cache, CacheConfig, DiskConfig, WriteMode};
use super::hooks::CacheHooks;
use super::memory::MemoryConfig;
use super::storage::InMemoryStorage;

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Set(u8, Vec<u8>),
    Get(u8),
    Invalidate(u8),
    Flush,
    Clear,
}

/// Keys from a small pool so operations collide
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..8, prop::collection::vec(any::<u8>(), 1..96)).prop_map(|(k, v)| Op::Set(k, v)),
        4 => (0u8..8).prop_map(Op::Get),
        2 => (0u8..8).prop_map(Op::Invalidate),
        1 => Just(Op::Flush),
        1 => Just(Op::Clear),
    ]
}

fn mode_strategy() -> impl Strategy<Value = WriteMode> {
    prop_oneof![Just(WriteMode::Deferred), Just(WriteMode::Synchronous)]
}

fn key(k: u8) -> CacheKey {
    CacheKey::new(format!("key-{}", k))
}

/// Memory small enough that most runs evict
fn small_cache(mode: WriteMode, storage: Arc<InMemoryStorage>) -> Cache {
    let config = CacheConfig {
        memory: MemoryConfig {
            capacity: 256,
            shard_count: 2,
            ..MemoryConfig::default()
        },
        disk: DiskConfig {
            write_mode: mode,
            write_queue_depth: 4,
            ..DiskConfig::default()
        },
        ..CacheConfig::default()
    };
    Cache::new(config, storage, CacheHooks::new()).unwrap()
}

// =============================================================================
// Model Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a sequential client always observes the model.
    #[test]
    fn prop_sequential_ops_match_model(
        mode in mode_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        tokio_test::block_on(async {
            let storage = Arc::new(InMemoryStorage::new());
            let cache = small_cache(mode, storage.clone());
            let mut model: HashMap<u8, Bytes> = HashMap::new();

            for op in ops {
                match op {
                    Op::Set(k, v) => {
                        let v = Bytes::from(v);
                        cache.set(key(k), v.clone()).await.unwrap();
                        model.insert(k, v);
                    }
                    Op::Get(k) => {
                        prop_assert_eq!(cache.get(&key(k)).await, model.get(&k).cloned());
                    }
                    Op::Invalidate(k) => {
                        let existed = cache.invalidate(&key(k)).await.unwrap();
                        prop_assert_eq!(existed, model.remove(&k).is_some());
                    }
                    Op::Flush => cache.flush().await,
                    Op::Clear => {
                        cache.invalidate_all().await.unwrap();
                        model.clear();
                    }
                }
                prop_assert!(cache.memory().size() <= cache.memory().capacity());
            }

            cache.flush().await;
            for k in 0u8..8 {
                prop_assert_eq!(storage.peek(&key(k)), model.get(&k).cloned());
            }
            prop_assert_eq!(storage.len(), model.len());

            cache.shutdown().await;
            Ok(())
        })?;
    }

    /// Property: the last write to a key wins in both tiers.
    #[test]
    fn prop_last_write_wins(
        mode in mode_strategy(),
        values in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..20),
    ) {
        tokio_test::block_on(async {
            let storage = Arc::new(InMemoryStorage::new());
            let cache = small_cache(mode, storage.clone());

            for v in &values {
                cache.set(key(0), v.clone()).await.unwrap();
            }
            cache.flush().await;

            let last = values.last().cloned().map(Bytes::from);
            prop_assert_eq!(cache.get(&key(0)).await, last.clone());
            prop_assert_eq!(storage.peek(&key(0)), last);

            cache.shutdown().await;
            Ok(())
        })?;
    }
}
