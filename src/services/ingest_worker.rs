//! Ingest worker pool - applies digests off the reader path
//!
//! Each worker owns a bounded queue. Digests are sharded by device id so a
//! device is always handled by the same worker, which keeps writes to a
//! device's hours serialized in-process. Submitting waits for queue space
//! instead of dropping digests.
//!
//! `IngestProgress` tracks event time across all shards: hours may only be
//! sealed behind the earliest digest still queued or being applied.

use crate::domain::error::IngestError;
use crate::domain::types::{DeviceDigest, DeviceId};
use crate::infra::metrics::Metrics;
use crate::services::engine::{IngestReport, RollupEngine};
use crate::services::tally_tracker::TallyTracker;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A digest waiting for a worker
#[derive(Debug)]
pub struct IngestJob {
    pub digest: DeviceDigest,
    /// When the job was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

/// Event-time progress of the pool
#[derive(Debug, Default)]
pub struct IngestProgress {
    state: Mutex<ProgressState>,
}

#[derive(Debug, Default)]
struct ProgressState {
    /// Earliest event time of each digest not yet finished, with multiplicity
    in_flight: BTreeMap<DateTime<Utc>, usize>,
    /// Latest collection time among finished digests
    applied: Option<DateTime<Utc>>,
}

impl IngestProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// A digest was handed to a worker queue
    pub fn begin(&self, digest: &DeviceDigest) {
        *self.state.lock().in_flight.entry(digest.earliest_time()).or_insert(0) += 1;
    }

    /// A digest left the pool: applied, or given up on and counted as failed
    pub fn finish(&self, digest: &DeviceDigest) {
        let mut state = self.state.lock();
        state.release(digest.earliest_time());
        state.applied = Some(state.applied.map_or(digest.collection_time, |a| a.max(digest.collection_time)));
    }

    /// A digest never reached a worker
    pub fn abandon(&self, digest: &DeviceDigest) {
        self.state.lock().release(digest.earliest_time());
    }

    /// Clock to seal against: the latest applied collection time, held back
    /// to the earliest event of any digest still in flight
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        match state.in_flight.keys().next() {
            Some(&oldest) => state.applied.map(|a| a.min(oldest)),
            None => state.applied,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.values().sum()
    }
}

impl ProgressState {
    fn release(&mut self, earliest: DateTime<Utc>) {
        if let Some(count) = self.in_flight.get_mut(&earliest) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&earliest);
            }
        }
    }
}

/// Worker that drains one shard's queue
pub struct IngestWorker {
    id: usize,
    engine: Arc<RollupEngine>,
    tally: Arc<TallyTracker>,
    rx: mpsc::Receiver<IngestJob>,
    metrics: Arc<Metrics>,
    progress: Arc<IngestProgress>,
    /// Extra attempts for a digest after a recoverable failure
    retry_limit: u32,
}

impl IngestWorker {
    pub fn new(
        id: usize,
        engine: Arc<RollupEngine>,
        tally: Arc<TallyTracker>,
        rx: mpsc::Receiver<IngestJob>,
        metrics: Arc<Metrics>,
        progress: Arc<IngestProgress>,
        retry_limit: u32,
    ) -> Self {
        Self { id, engine, tally, rx, metrics, progress, retry_limit }
    }

    /// Run until every sender is dropped
    pub async fn run(mut self) {
        info!(worker = self.id, "ingest_worker_started");

        while let Some(job) = self.rx.recv().await {
            self.metrics.queue_depth_dec();
            let queue_delay_us = job.enqueued_at.elapsed().as_micros() as u64;
            if queue_delay_us > 1_000_000 {
                warn!(
                    worker = self.id,
                    device_id = %job.digest.device_id,
                    queue_delay_us = %queue_delay_us,
                    "ingest_queue_delay_high"
                );
            }
            // The outcome is logged by process(); a failed digest is counted there
            let _ = self.process(&job.digest).await;
            self.progress.finish(&job.digest);
        }

        info!(worker = self.id, "ingest_worker_stopped");
    }

    /// Normalize once, feed the tally, then apply with bounded retries
    pub async fn process(&self, digest: &DeviceDigest) -> Result<IngestReport, IngestError> {
        let normalized = self.engine.normalize(digest);
        self.tally.record_normalized(&normalized, digest.collection_time);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.engine.apply(&normalized).await {
                Ok(report) => return Ok(report),
                Err(e) if !e.is_structural() && attempt <= self.retry_limit => {
                    let delay = self.engine.retry_policy().backoff(attempt);
                    warn!(
                        worker = self.id,
                        device_id = %digest.device_id,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "digest_retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.record_digest_failed();
                    error!(
                        worker = self.id,
                        device_id = %digest.device_id,
                        attempts = attempt,
                        error = %e,
                        "digest_failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Sharded set of ingest workers
pub struct IngestPool {
    senders: Vec<mpsc::Sender<IngestJob>>,
    handles: Vec<JoinHandle<()>>,
    metrics: Arc<Metrics>,
    progress: Arc<IngestProgress>,
}

impl IngestPool {
    /// Spawn `workers` workers, each with a queue of `queue_capacity` digests
    pub fn start(
        engine: Arc<RollupEngine>,
        tally: Arc<TallyTracker>,
        metrics: Arc<Metrics>,
        progress: Arc<IngestProgress>,
        workers: usize,
        queue_capacity: usize,
        retry_limit: u32,
    ) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            let worker = IngestWorker::new(
                id,
                engine.clone(),
                tally.clone(),
                rx,
                metrics.clone(),
                progress.clone(),
                retry_limit,
            );
            senders.push(tx);
            handles.push(tokio::spawn(worker.run()));
        }
        info!(workers, queue_capacity, "ingest_pool_started");
        Self { senders, handles, metrics, progress }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Worker index for a device
    pub fn shard(&self, device_id: &DeviceId) -> usize {
        shard_for(device_id, self.senders.len())
    }

    /// Queue a digest, waiting while the shard's queue is full
    pub async fn submit(&self, digest: DeviceDigest) -> Result<()> {
        let shard = self.shard(&digest.device_id);
        self.metrics.queue_depth_inc();
        self.progress.begin(&digest);
        let job = IngestJob { digest, enqueued_at: Instant::now() };
        if let Err(mpsc::error::SendError(job)) = self.senders[shard].send(job).await {
            self.metrics.queue_depth_dec();
            self.progress.abandon(&job.digest);
            bail!("ingest worker {shard} has stopped");
        }
        Ok(())
    }

    /// Close the queues and wait for workers to drain them
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "ingest_worker_join_failed");
            }
        }
        info!("ingest_pool_stopped");
    }
}

pub fn shard_for(device_id: &DeviceId, workers: usize) -> usize {
    let mut hasher = FxHasher::default();
    device_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}
