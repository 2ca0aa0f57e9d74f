//! Cache Metrics Collection
//!
//! Lock-free counters for monitoring cache health.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookups
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_read: AtomicU64,

    // Transactions
    commits: AtomicU64,
    aborts: AtomicU64,
    bytes_written: AtomicU64,

    // Eviction
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,

    // Occupancy
    used_bytes: AtomicU64,
    entries: AtomicU64,

    // Commit latency (microseconds, exponential moving average)
    commit_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, bytes: u64, latency: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.update_latency_ema(&self.commit_latency_us, latency);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn update_occupancy(&self, used_bytes: u64, entries: u64) {
        self.used_bytes.store(used_bytes, Ordering::Relaxed);
        self.entries.store(entries, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn commit_latency(&self) -> Duration {
        Duration::from_micros(self.commit_latency_us.load(Ordering::Relaxed))
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            commits: self.commits(),
            aborts: self.aborts(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            evictions: self.evictions(),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
            commit_latency_us: self.commit_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters; occupancy is left alone
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.commits.store(0, Ordering::Relaxed);
        self.aborts.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.evicted_bytes.store(0, Ordering::Relaxed);
        self.commit_latency_us.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub bytes_read: u64,
    pub commits: u64,
    pub aborts: u64,
    pub bytes_written: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub used_bytes: u64,
    pub entries: u64,
    pub commit_latency_us: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_hit(10);
        metrics.record_hit(20);
        metrics.record_miss();

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
        assert_eq!(metrics.snapshot().bytes_read, 30);
    }

    #[test]
    fn test_commit_latency_ema() {
        let metrics = CacheMetrics::new();

        metrics.record_commit(100, Duration::from_micros(100));
        assert_eq!(metrics.commit_latency(), Duration::from_micros(100));

        metrics.record_commit(100, Duration::from_micros(200));
        let latency = metrics.commit_latency().as_micros();
        assert!(latency > 100 && latency < 200);
        assert_eq!(metrics.commits(), 2);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_eviction(600);
        metrics.record_abort();
        metrics.update_occupancy(600, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.evictions, 1);
        assert_eq!(snapshot.evicted_bytes, 600);
        assert_eq!(snapshot.aborts, 1);
        assert_eq!(snapshot.used_bytes, 600);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.evictions, 0);
        assert_eq!(snapshot.aborts, 0);
        assert_eq!(snapshot.used_bytes, 600);
    }

    #[test]
    fn test_empty_hit_ratio() {
        assert_eq!(CacheMetrics::new().hit_ratio(), 0.0);
    }
}
