//! Cache Metrics Collection
//!
//! Per-tier counters and latency averages for monitoring cache health, with
//! Prometheus text exposition for scraping or the `status` command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Error, Result};

/// Inverse weight of a new latency sample
const EMA_GAIN: u64 = 8;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Memory tier
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    memory_evictions: AtomicU64,

    // Write-behind buffer
    pending_hits: AtomicU64,

    // Disk tier
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    disk_read_errors: AtomicU64,
    disk_write_errors: AtomicU64,
    disk_writes: AtomicU64,

    // Tier movement
    promotions: AtomicU64,
    promotions_skipped: AtomicU64,

    // Write path
    writes_skipped: AtomicU64,
    stale_writes_dropped: AtomicU64,
    deferred_writes_rejected: AtomicU64,

    // Smoothed operation latencies (nanoseconds, 0 = no sample yet)
    memory_read_latency_ns: AtomicU64,
    disk_read_latency_ns: AtomicU64,
    disk_write_latency_ns: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_memory_hit, memory_hits, memory_hits);
    counter!(record_memory_miss, memory_misses, memory_misses);
    counter!(record_pending_hit, pending_hits, pending_hits);
    counter!(record_disk_hit, disk_hits, disk_hits);
    counter!(record_disk_miss, disk_misses, disk_misses);
    counter!(record_disk_read_error, disk_read_errors, disk_read_errors);
    counter!(record_disk_write_error, disk_write_errors, disk_write_errors);
    counter!(record_disk_write, disk_writes, disk_writes);
    counter!(record_promotion, promotions, promotions);
    counter!(record_promotion_skipped, promotions_skipped, promotions_skipped);
    counter!(record_write_skipped, writes_skipped, writes_skipped);
    counter!(record_stale_write_dropped, stale_writes_dropped, stale_writes_dropped);
    counter!(
        record_deferred_write_rejected,
        deferred_writes_rejected,
        deferred_writes_rejected
    );

    pub fn record_evictions(&self, count: u64) {
        self.memory_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn memory_evictions(&self) -> u64 {
        self.memory_evictions.load(Ordering::Relaxed)
    }

    pub fn memory_hit_ratio(&self) -> f64 {
        ratio(self.memory_hits(), self.memory_misses())
    }

    /// Fraction of lookups answered by any tier
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits = self.memory_hits() + self.pending_hits() + self.disk_hits();
        // Only count final misses
        ratio(hits, self.disk_misses() + self.disk_read_errors())
    }

    // Latency tracking
    pub fn record_memory_read_latency(&self, duration: Duration) {
        update_latency_ema(&self.memory_read_latency_ns, duration);
    }

    pub fn record_disk_read_latency(&self, duration: Duration) {
        update_latency_ema(&self.disk_read_latency_ns, duration);
    }

    pub fn record_disk_write_latency(&self, duration: Duration) {
        update_latency_ema(&self.disk_write_latency_ns, duration);
    }

    pub fn memory_read_latency(&self) -> Duration {
        Duration::from_nanos(self.memory_read_latency_ns.load(Ordering::Relaxed))
    }

    pub fn disk_read_latency(&self) -> Duration {
        Duration::from_nanos(self.disk_read_latency_ns.load(Ordering::Relaxed))
    }

    pub fn disk_write_latency(&self) -> Duration {
        Duration::from_nanos(self.disk_write_latency_ns.load(Ordering::Relaxed))
    }

    /// Get snapshot of all counters; tier gauges are filled in by the caller
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.memory_hits(),
            memory_misses: self.memory_misses(),
            memory_evictions: self.memory_evictions(),
            memory_hit_ratio: self.memory_hit_ratio(),
            memory_read_latency: self.memory_read_latency(),
            memory_entries: 0,
            memory_size: 0,
            memory_capacity: 0,

            pending_hits: self.pending_hits(),
            pending_writes: 0,

            disk_hits: self.disk_hits(),
            disk_misses: self.disk_misses(),
            disk_read_errors: self.disk_read_errors(),
            disk_write_errors: self.disk_write_errors(),
            disk_writes: self.disk_writes(),
            disk_read_latency: self.disk_read_latency(),
            disk_write_latency: self.disk_write_latency(),
            disk_available: false,

            promotions: self.promotions(),
            promotions_skipped: self.promotions_skipped(),
            writes_skipped: self.writes_skipped(),
            stale_writes_dropped: self.stale_writes_dropped(),
            deferred_writes_rejected: self.deferred_writes_rejected(),

            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Fold a sample into a smoothed latency (gain 1/8); the first sample
/// seeds the average
fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let sample = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX).max(1);
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(match current {
            0 => sample,
            _ => current - current / EMA_GAIN + sample / EMA_GAIN,
        })
    });
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    // Memory
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub memory_evictions: u64,
    pub memory_hit_ratio: f64,
    pub memory_read_latency: Duration,
    pub memory_entries: u64,
    pub memory_size: u64,
    pub memory_capacity: u64,

    // Write-behind
    pub pending_hits: u64,
    pub pending_writes: u64,

    // Disk
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub disk_read_errors: u64,
    pub disk_write_errors: u64,
    pub disk_writes: u64,
    pub disk_read_latency: Duration,
    pub disk_write_latency: Duration,
    pub disk_available: bool,

    // Tier movement and write path
    pub promotions: u64,
    pub promotions_skipped: u64,
    pub writes_skipped: u64,
    pub stale_writes_dropped: u64,
    pub deferred_writes_rejected: u64,

    // Overall
    pub overall_hit_ratio: f64,
}

impl MetricsSnapshot {
    /// Render in the Prometheus text exposition format
    pub fn to_prometheus(&self) -> Result<String> {
        let registry = Registry::new_custom(Some("tiercache".to_string()), None)
            .map_err(prometheus_error)?;

        let counters: [(&str, &str, u64); 14] = [
            ("memory_hits_total", "Lookups served from memory", self.memory_hits),
            ("memory_misses_total", "Lookups not found in memory", self.memory_misses),
            ("memory_evictions_total", "Entries evicted from memory", self.memory_evictions),
            ("pending_hits_total", "Lookups served from the write-behind buffer", self.pending_hits),
            ("disk_hits_total", "Lookups served from disk", self.disk_hits),
            ("disk_misses_total", "Lookups absent from both tiers", self.disk_misses),
            ("disk_read_errors_total", "Disk reads that failed", self.disk_read_errors),
            ("disk_write_errors_total", "Disk writes or removes that failed", self.disk_write_errors),
            ("disk_writes_total", "Disk writes applied", self.disk_writes),
            ("promotions_total", "Disk hits copied into memory", self.promotions),
            ("promotions_skipped_total", "Promotions abandoned after a racing mutation", self.promotions_skipped),
            ("writes_skipped_total", "Values kept out of the disk tier", self.writes_skipped),
            ("stale_writes_dropped_total", "Deferred writes superseded before landing", self.stale_writes_dropped),
            ("deferred_writes_rejected_total", "Deferred writes issued after shutdown", self.deferred_writes_rejected),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help).map_err(prometheus_error)?;
            counter.inc_by(value);
            registry
                .register(Box::new(counter))
                .map_err(prometheus_error)?;
        }

        let int_gauges: [(&str, &str, u64); 5] = [
            ("memory_entries", "Entries resident in memory", self.memory_entries),
            ("memory_size", "Memory cost units in use", self.memory_size),
            ("memory_capacity", "Memory cost capacity", self.memory_capacity),
            ("pending_writes", "Disk mutations not yet applied", self.pending_writes),
            ("disk_available", "1 if the disk tier is serving", self.disk_available as u64),
        ];
        for (name, help, value) in int_gauges {
            let gauge = IntGauge::new(name, help).map_err(prometheus_error)?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge)).map_err(prometheus_error)?;
        }

        let float_gauges: [(&str, &str, f64); 5] = [
            ("memory_hit_ratio", "Memory hit ratio", self.memory_hit_ratio),
            ("overall_hit_ratio", "Hit ratio across all tiers", self.overall_hit_ratio),
            ("memory_read_latency_seconds", "Memory read latency (EMA)", self.memory_read_latency.as_secs_f64()),
            ("disk_read_latency_seconds", "Disk read latency (EMA)", self.disk_read_latency.as_secs_f64()),
            ("disk_write_latency_seconds", "Disk write latency (EMA)", self.disk_write_latency.as_secs_f64()),
        ];
        for (name, help, value) in float_gauges {
            let gauge = Gauge::new(name, help).map_err(prometheus_error)?;
            gauge.set(value);
            registry.register(Box::new(gauge)).map_err(prometheus_error)?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(prometheus_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn prometheus_error(err: prometheus::Error) -> Error {
    Error::Internal(format!("metrics export failed: {}", err))
}

// =============================================================================
// Tests
// =============================================================================
