//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Digests fully applied (monotonic)
    digests_total: AtomicU64,
    /// Digests since last report (reset on report)
    digests_since_report: AtomicU64,
    /// Digests given up on after retries (monotonic)
    digests_failed: AtomicU64,
    events_accepted: AtomicU64,
    /// Events dropped by the normalizer or a sealed hour
    events_rejected: AtomicU64,
    /// Events kept but flagged against an unregistered device/trigger
    events_unregistered: AtomicU64,
    sealed_hour_events: AtomicU64,
    rollups_written: AtomicU64,
    /// Recomputations that produced an identical rollup (replays)
    rollups_unchanged: AtomicU64,
    rollups_finalized: AtomicU64,
    store_conflicts: AtomicU64,
    retries_exhausted: AtomicU64,
    structural_failures: AtomicU64,
    /// Sum of ingest latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max ingest latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Ingest latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Digests waiting in worker queues (updated by workers)
    queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            digests_total: AtomicU64::new(0),
            digests_since_report: AtomicU64::new(0),
            digests_failed: AtomicU64::new(0),
            events_accepted: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            events_unregistered: AtomicU64::new(0),
            sealed_hour_events: AtomicU64::new(0),
            rollups_written: AtomicU64::new(0),
            rollups_unchanged: AtomicU64::new(0),
            rollups_finalized: AtomicU64::new(0),
            store_conflicts: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
            structural_failures: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a digest that was applied, with its end-to-end ingest latency
    #[inline]
    pub fn record_digest_ingested(&self, latency_us: u64) {
        self.digests_total.fetch_add(1, Ordering::Relaxed);
        self.digests_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_digest_failed(&self) {
        self.digests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of normalizing one digest
    #[inline]
    pub fn record_events(&self, accepted: u64, rejected: u64, unregistered: u64) {
        self.events_accepted.fetch_add(accepted, Ordering::Relaxed);
        self.events_rejected.fetch_add(rejected, Ordering::Relaxed);
        self.events_unregistered.fetch_add(unregistered, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sealed_hour_events(&self, count: u64) {
        self.sealed_hour_events.fetch_add(count, Ordering::Relaxed);
        self.events_rejected.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rollup_written(&self) {
        self.rollups_written.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rollup_unchanged(&self) {
        self.rollups_unchanged.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rollup_finalized(&self) {
        self.rollups_finalized.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_conflict(&self) {
        self.store_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retries_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_structural_failure(&self) {
        self.structural_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn queue_depth_inc(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn queue_depth_dec(&self) {
        // Saturating: a late decrement after a reset must not wrap
        let _ = self.queue_depth.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    #[inline]
    pub fn digests_total(&self) -> u64 {
        self.digests_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn digests_failed(&self) -> u64 {
        self.digests_failed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rollups_written(&self) -> u64 {
        self.rollups_written.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rollups_unchanged(&self) -> u64 {
        self.rollups_unchanged.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store_conflicts(&self) -> u64 {
        self.store_conflicts.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Generate a summary report and reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, tracked_devices: usize) -> MetricsSummary {
        let digests_count = self.digests_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let digests_per_sec = if elapsed.as_secs_f64() > 0.0 {
            digests_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if digests_count > 0 { latency_sum / digests_count } else { 0 };

        MetricsSummary {
            digests_total: self.digests_total.load(Ordering::Relaxed),
            digests_per_sec,
            digests_failed: self.digests_failed.load(Ordering::Relaxed),
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            events_unregistered: self.events_unregistered.load(Ordering::Relaxed),
            sealed_hour_events: self.sealed_hour_events.load(Ordering::Relaxed),
            rollups_written: self.rollups_written.load(Ordering::Relaxed),
            rollups_unchanged: self.rollups_unchanged.load(Ordering::Relaxed),
            rollups_finalized: self.rollups_finalized.load(Ordering::Relaxed),
            store_conflicts: self.store_conflicts.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            structural_failures: self.structural_failures.load(Ordering::Relaxed),
            avg_ingest_latency_us: avg_latency,
            max_ingest_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            tracked_devices,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub digests_total: u64,
    pub digests_per_sec: f64,
    pub digests_failed: u64,
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub events_unregistered: u64,
    pub sealed_hour_events: u64,
    pub rollups_written: u64,
    pub rollups_unchanged: u64,
    pub rollups_finalized: u64,
    pub store_conflicts: u64,
    pub retries_exhausted: u64,
    pub structural_failures: u64,
    pub avg_ingest_latency_us: u64,
    pub max_ingest_latency_us: u64,
    /// Ingest latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    /// Current worker queue depth (snapshot)
    pub queue_depth: u64,
    /// Devices with a live tally
    pub tracked_devices: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            digests_total = %self.digests_total,
            digests_per_sec = format!("{:.1}", self.digests_per_sec),
            digests_failed = %self.digests_failed,
            events_accepted = %self.events_accepted,
            events_rejected = %self.events_rejected,
            rollups_written = %self.rollups_written,
            rollups_unchanged = %self.rollups_unchanged,
            rollups_finalized = %self.rollups_finalized,
            store_conflicts = %self.store_conflicts,
            avg_latency_us = %self.avg_ingest_latency_us,
            p99_us = %self.lat_p99_us,
            queue_depth = %self.queue_depth,
            tracked_devices = %self.tracked_devices,
            "metrics"
        );
    }
}
