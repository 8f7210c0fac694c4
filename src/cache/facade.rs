//! Cache Facade - Unified Two-Tier Cache
//!
//! Orchestrates the memory tier and the disk tier: lookups fall through
//! memory, then writes still in flight, then disk, and disk hits are
//! promoted into memory.
//!
//! # Per-key ordering
//!
//! Every mutation takes the key's stripe lock, bumps the stripe's sequence,
//! updates memory and records a ticket in the key ledger. The ledger holds
//! the latest disk effect that has not landed yet (value or tombstone), so:
//!
//! - readers see the latest write even after memory evicted it
//! - the write-behind worker drops jobs whose ticket is no longer the latest
//! - a promotion is abandoned if the stripe sequence moved during the disk
//!   read
//!
//! `invalidate_all` bumps an epoch under all stripe locks; deferred writes
//! from an older epoch never reach the disk.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::disk::DiskTier;
use super::entry::{CacheEntry, CacheKey};
use super::hooks::{CacheHooks, StorageFault};
use super::memory::{MemoryConfig, MemoryTier};
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::migration::{FormatVersion, MigrationOutcome};
use super::storage::StorageBackend;
use super::{DEFAULT_SHARD_COUNT, DEFAULT_WRITE_QUEUE_DEPTH};
use crate::error::{Error, Result};

/// Tier that answered a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheTier {
    /// Memory tier (no I/O)
    Memory,
    /// A write accepted but not yet on disk
    Pending,
    /// Disk tier
    Disk,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::Memory => write!(f, "memory"),
            CacheTier::Pending => write!(f, "pending"),
            CacheTier::Disk => write!(f, "disk"),
        }
    }
}

/// When `set` writes the disk tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Queue the write for the background worker; failures are diagnostics
    #[default]
    Deferred,
    /// Write before returning and report the error
    Synchronous,
}

/// Disk tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Format version stamped on the storage location
    pub format_version: FormatVersion,
    pub write_mode: WriteMode,
    /// Bound of the write-behind queue; `set` waits when it is full
    pub write_queue_depth: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            format_version: FormatVersion::new("1"),
            write_mode: WriteMode::default(),
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub memory: MemoryConfig,
    pub disk: DiskConfig,
    /// Copy disk hits into memory
    pub promote_on_disk_hit: bool,
    /// Skip promotion for payloads larger than this many bytes
    pub max_promote_size: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            disk: DiskConfig::default(),
            promote_on_disk_hit: true,
            max_promote_size: None,
        }
    }
}

impl CacheConfig {
    /// Check the configuration for values the tiers cannot work with
    pub fn validate(&self) -> Result<()> {
        let memory = &self.memory;
        if memory.capacity == 0 {
            return Err(Error::Config("memory capacity must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&memory.high_watermark)
            || !(0.0..=1.0).contains(&memory.low_watermark)
            || memory.low_watermark > memory.high_watermark
        {
            return Err(Error::Config(format!(
                "watermarks must satisfy 0 <= low ({}) <= high ({}) <= 1",
                memory.low_watermark, memory.high_watermark
            )));
        }
        if memory.eviction_batch_size == 0 {
            return Err(Error::Config("eviction batch size must be positive".to_string()));
        }
        if self.disk.write_queue_depth == 0 {
            return Err(Error::Config("write queue depth must be positive".to_string()));
        }
        if self.disk.format_version.as_str().is_empty() {
            return Err(Error::Config("format version must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub payload: Bytes,
    /// Which tier the value was found in
    pub tier: CacheTier,
    /// Lookup latency
    pub latency: Duration,
}

/// Latest disk effect of a key that has not landed yet
struct Pending {
    ticket: u64,
    /// `None` is a tombstone
    payload: Option<Bytes>,
}

enum WriteJob {
    Apply {
        key: CacheKey,
        ticket: u64,
        epoch: u64,
        payload: Option<Bytes>,
    },
    Flush(oneshot::Sender<()>),
}

/// A mutation recorded under its stripe lock
struct Mutation {
    ticket: u64,
    epoch: u64,
    /// Whether a tier held the key before
    held: bool,
    evicted: Vec<(CacheKey, CacheEntry)>,
}

struct CacheInner {
    memory: MemoryTier,
    disk: DiskTier,
    hooks: CacheHooks,
    config: CacheConfig,
    metrics: CacheMetrics,
    ledger: DashMap<CacheKey, Pending>,
    next_ticket: AtomicU64,
    /// Mutation sequence per key stripe
    stripes: Box<[Mutex<u64>]>,
    epoch: AtomicU64,
}

/// Two-tier cache
///
/// Needs a running tokio runtime: construction spawns the write-behind
/// worker.
pub struct Cache {
    inner: Arc<CacheInner>,
    jobs: mpsc::Sender<WriteJob>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Cache {
    /// Create a cache; the disk tier initializes on first use
    pub fn new(
        config: CacheConfig,
        backend: Arc<dyn StorageBackend>,
        hooks: CacheHooks,
    ) -> Result<Self> {
        config.validate()?;

        let stripes: Vec<Mutex<u64>> = (0..DEFAULT_SHARD_COUNT).map(|_| Mutex::new(0)).collect();
        let inner = Arc::new(CacheInner {
            memory: MemoryTier::new(config.memory.clone()),
            disk: DiskTier::new(
                backend,
                config.disk.format_version.clone(),
                hooks.migration.clone(),
            ),
            hooks,
            metrics: CacheMetrics::new(),
            ledger: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            stripes: stripes.into_boxed_slice(),
            epoch: AtomicU64::new(0),
            config,
        });

        let (jobs, queue) = mpsc::channel(inner.config.disk.write_queue_depth);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_write_behind(Arc::clone(&inner), queue, cancel.clone()));

        Ok(Self {
            inner,
            jobs,
            cancel,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a cache and resolve the disk format version before returning.
    ///
    /// A disk tier that cannot be initialized does not fail the open; the
    /// cache then serves from memory only.
    pub async fn open(
        config: CacheConfig,
        backend: Arc<dyn StorageBackend>,
        hooks: CacheHooks,
    ) -> Result<Self> {
        let cache = Self::new(config, backend, hooks)?;
        match cache.inner.disk.initialize().await {
            Ok(outcome) => info!(
                decision = %outcome.decision,
                version = %outcome.stamped_version,
                "Cache opened"
            ),
            Err(e) => warn!(error = %e, "Cache opened without disk tier"),
        }
        Ok(cache)
    }

    /// Get a value, or `None` if no tier holds it
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.lookup(key).await.map(|hit| hit.payload)
    }

    /// Get a value along with the tier that served it
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheHit> {
        let inner = &self.inner;
        let start = Instant::now();
        if let Some(entry) = inner.memory.get(key) {
            inner.metrics.record_memory_hit();
            inner.metrics.record_memory_read_latency(start.elapsed());
            return Some(CacheHit {
                payload: entry.data().clone(),
                tier: CacheTier::Memory,
                latency: start.elapsed(),
            });
        }
        inner.metrics.record_memory_miss();

        // Sampled before the ledger and disk reads so a racing mutation
        // cancels the promotion
        let observed = *inner.stripe(key).lock();

        if let Some(pending) = inner.ledger.get(key) {
            return match &pending.payload {
                Some(payload) => {
                    inner.metrics.record_pending_hit();
                    Some(CacheHit {
                        payload: payload.clone(),
                        tier: CacheTier::Pending,
                        latency: start.elapsed(),
                    })
                }
                None => {
                    inner.metrics.record_disk_miss();
                    None
                }
            };
        }

        let disk_read = Instant::now();
        match inner.disk.get(key).await {
            Ok(Some(payload)) => {
                inner.metrics.record_disk_hit();
                inner.metrics.record_disk_read_latency(disk_read.elapsed());
                inner.promote(key, &payload, observed);
                Some(CacheHit {
                    payload,
                    tier: CacheTier::Disk,
                    latency: start.elapsed(),
                })
            }
            Ok(None) => {
                inner.metrics.record_disk_miss();
                None
            }
            Err(e) => {
                inner.metrics.record_disk_read_error();
                inner.report_fault("get", Some(key), &e);
                None
            }
        }
    }

    /// Store a value using the configured write mode.
    ///
    /// The memory tier is updated before this returns. The returned error,
    /// in synchronous mode only, is the disk write's; the memory write is
    /// never rolled back.
    pub async fn set(&self, key: impl Into<CacheKey>, payload: impl Into<Bytes>) -> Result<()> {
        let mode = self.inner.config.disk.write_mode;
        self.set_with_mode(key.into(), payload.into(), mode).await
    }

    /// Store a value and write the disk tier before returning
    pub async fn set_durable(
        &self,
        key: impl Into<CacheKey>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.set_with_mode(key.into(), payload.into(), WriteMode::Synchronous)
            .await
    }

    async fn set_with_mode(&self, key: CacheKey, payload: Bytes, mode: WriteMode) -> Result<()> {
        let inner = &self.inner;
        let persist = inner.hooks.disk.persists(&key, &payload);
        let cost = inner.hooks.memory.cost_of(&key, &payload);

        // A memory-only value still supersedes whatever the disk holds
        let disk_effect = persist.then(|| payload.clone());
        let mutation = inner.mutate(&key, disk_effect.clone(), |memory| {
            let outcome = memory.put(key.clone(), CacheEntry::with_cost(payload, cost));
            if !outcome.stored {
                debug!(key = %key, cost, "Value exceeds memory capacity");
            }
            outcome.evicted
        });
        inner.evicted(&mutation.evicted);

        if !persist {
            inner.metrics.record_write_skipped();
            debug!(key = %key, "Value kept out of the disk tier");
        }

        match mode {
            WriteMode::Synchronous => inner
                .apply(&key, mutation.ticket, mutation.epoch, disk_effect)
                .await
                .map(|_| ()),
            WriteMode::Deferred => {
                self.enqueue(key, mutation.ticket, mutation.epoch, disk_effect)
                    .await;
                Ok(())
            }
        }
    }

    /// Remove a key from both tiers.
    ///
    /// Returns whether any tier held it. Writes still queued for the key are
    /// superseded.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let inner = &self.inner;
        let mutation = inner.mutate(key, None, |memory| {
            memory.remove(key);
            Vec::new()
        });

        match inner.apply(key, mutation.ticket, mutation.epoch, None).await? {
            Some(existed) => Ok(mutation.held || existed),
            None => Ok(mutation.held),
        }
    }

    /// Remove every entry from both tiers.
    ///
    /// Memory is cleared before the call waits on anything, atomically with
    /// respect to `set`, and once more when the wipe has exclusive access;
    /// writes issued before the call never reach the disk.
    pub async fn invalidate_all(&self) -> Result<()> {
        let inner = &self.inner;
        let mut dropped = 0;
        let result = inner
            .disk
            .wipe_with(|| {
                let mut sequences: Vec<_> = inner.stripes.iter().map(|s| s.lock()).collect();
                inner.epoch.fetch_add(1, Ordering::SeqCst);
                for seq in sequences.iter_mut() {
                    **seq += 1;
                }
                inner.ledger.clear();
                dropped += inner.memory.clear();
            })
            .await;
        info!(dropped, "Cleared memory tier");

        if let Err(e) = &result {
            inner.report_fault("wipe", None, e);
        }
        result
    }

    /// Wait until every write enqueued before this call has been applied
    pub async fn flush(&self) {
        let (done, applied) = oneshot::channel();
        if self.jobs.send(WriteJob::Flush(done)).await.is_ok() {
            let _ = applied.await;
        }
    }

    /// Flush pending writes and stop the write-behind worker.
    ///
    /// Deferred writes issued afterwards are reported as storage faults.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush().await;
        self.cancel.cancel();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Write-behind worker failed");
            }
        }
        info!("Cache shut down");
    }

    async fn enqueue(&self, key: CacheKey, ticket: u64, epoch: u64, payload: Option<Bytes>) {
        if !self.closed.load(Ordering::SeqCst) {
            let job = WriteJob::Apply {
                key: key.clone(),
                ticket,
                epoch,
                payload,
            };
            if self.jobs.send(job).await.is_ok() {
                return;
            }
        }

        let inner = &self.inner;
        inner.metrics.record_deferred_write_rejected();
        inner.release(&key, ticket);
        inner.report_fault(
            "put",
            Some(&key),
            &Error::Internal("cache is shut down".to_string()),
        );
    }

    /// Outcome of the disk tier's version check, running it if needed
    pub async fn migration_outcome(&self) -> Result<MigrationOutcome> {
        self.inner.disk.initialize().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let mut snapshot = inner.metrics.snapshot();
        snapshot.memory_entries = inner.memory.len() as u64;
        snapshot.memory_size = inner.memory.size();
        snapshot.memory_capacity = inner.memory.capacity();
        snapshot.pending_writes = inner.ledger.len() as u64;
        snapshot.disk_available = inner.disk.is_available();
        snapshot
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.inner.memory
    }

    pub fn disk(&self) -> &DiskTier {
        &self.inner.disk
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

impl CacheInner {
    fn stripe(&self, key: &CacheKey) -> &Mutex<u64> {
        &self.stripes[key.shard_index(self.stripes.len())]
    }

    /// Record a mutation: bump the stripe, issue a ticket, stage the disk
    /// effect in the ledger and update memory, all under the stripe lock.
    fn mutate(
        &self,
        key: &CacheKey,
        disk_effect: Option<Bytes>,
        update_memory: impl FnOnce(&MemoryTier) -> Vec<(CacheKey, CacheEntry)>,
    ) -> Mutation {
        let mut seq = self.stripe(key).lock();
        *seq += 1;

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let previous = self.ledger.insert(
            key.clone(),
            Pending {
                ticket,
                payload: disk_effect,
            },
        );
        let held = self.memory.contains(key)
            || previous.is_some_and(|pending| pending.payload.is_some());
        let evicted = update_memory(&self.memory);

        Mutation {
            ticket,
            epoch,
            held,
            evicted,
        }
    }

    fn is_current(&self, key: &CacheKey, ticket: u64, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
            && self
                .ledger
                .get(key)
                .is_some_and(|pending| pending.ticket == ticket)
    }

    /// Drop the ledger record if it is still ours
    fn release(&self, key: &CacheKey, ticket: u64) {
        self.ledger
            .remove_if(key, |_, pending| pending.ticket == ticket);
    }

    /// Apply a staged disk effect unless a newer mutation superseded it.
    ///
    /// `Ok(None)` means the effect was dropped; `Ok(Some(existed))` reports,
    /// for removals, whether the disk held the key.
    async fn apply(
        &self,
        key: &CacheKey,
        ticket: u64,
        epoch: u64,
        payload: Option<Bytes>,
    ) -> Result<Option<bool>> {
        if !self.is_current(key, ticket, epoch) {
            self.metrics.record_stale_write_dropped();
            self.release(key, ticket);
            return Ok(None);
        }

        let started = Instant::now();
        let writing = payload.is_some();
        let result = match payload {
            Some(payload) => self
                .disk
                .put_if(key, payload, || self.is_current(key, ticket, epoch))
                .await
                .map(|applied| applied.then_some(true)),
            None => {
                self.disk
                    .remove_if(key, || self.is_current(key, ticket, epoch))
                    .await
            }
        };
        // A failed removal keeps its tombstone so the disk copy stays hidden
        // until the key is written, invalidated again or cleared
        if writing || result.is_ok() {
            self.release(key, ticket);
        }

        match &result {
            Ok(Some(_)) if writing => {
                self.metrics.record_disk_write();
                self.metrics.record_disk_write_latency(started.elapsed());
            }
            Ok(Some(_)) => {}
            Ok(None) => self.metrics.record_stale_write_dropped(),
            Err(e) => {
                self.metrics.record_disk_write_error();
                self.report_fault(if writing { "put" } else { "remove" }, Some(key), e);
            }
        }
        result
    }

    /// Copy a disk hit into memory unless the key was mutated meanwhile
    fn promote(&self, key: &CacheKey, payload: &Bytes, observed: u64) {
        if !self.config.promote_on_disk_hit {
            return;
        }
        if self
            .config
            .max_promote_size
            .is_some_and(|max| payload.len() as u64 > max)
        {
            return;
        }

        let cost = self.hooks.memory.cost_of(key, payload);
        let evicted = {
            let seq = self.stripe(key).lock();
            if *seq != observed {
                self.metrics.record_promotion_skipped();
                debug!(key = %key, "Promotion raced a mutation, skipped");
                return;
            }
            let outcome = self
                .memory
                .put(key.clone(), CacheEntry::with_cost(payload.clone(), cost));
            if outcome.stored {
                self.metrics.record_promotion();
            }
            outcome.evicted
        };
        self.evicted(&evicted);
    }

    /// Count evictions and run the eviction hook, outside all locks
    fn evicted(&self, evicted: &[(CacheKey, CacheEntry)]) {
        if evicted.is_empty() {
            return;
        }
        self.metrics.record_evictions(evicted.len() as u64);
        self.hooks.memory.evicted(evicted);
    }

    /// Surface a disk failure that is not returned to the caller
    fn report_fault(&self, operation: &'static str, key: Option<&CacheKey>, error: &Error) {
        warn!(
            operation,
            key = key.map(CacheKey::as_str),
            error = %error,
            "Disk tier fault"
        );
        self.hooks.disk.report(&StorageFault {
            operation,
            key: key.cloned(),
            error: error.to_string(),
        });
    }
}

/// Write-behind worker: applies queued disk effects in order.
///
/// On cancellation the queue is closed and every job already in it is
/// still applied; later sends fail and are reported by the sender.
async fn run_write_behind(
    inner: Arc<CacheInner>,
    mut queue: mpsc::Receiver<WriteJob>,
    cancel: CancellationToken,
) {
    debug!("Write-behind worker started");
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = queue.recv() => job,
        };
        match job {
            Some(job) => process_job(&inner, job).await,
            None => break,
        }
    }

    queue.close();
    let mut drained = 0u64;
    while let Some(job) = queue.recv().await {
        drained += 1;
        process_job(&inner, job).await;
    }
    debug!(drained, "Write-behind worker stopped");
}

async fn process_job(inner: &CacheInner, job: WriteJob) {
    match job {
        WriteJob::Apply {
            key,
            ticket,
            epoch,
            payload,
        } => {
            // Failures are reported inside apply
            let _ = inner.apply(&key, ticket, epoch, payload).await;
        }
        WriteJob::Flush(done) => {
            let _ = done.send(());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
