//! Rollup engine - applies normalized digests to the rollup store
//!
//! Per hour group the engine:
//! - loads the stored rollup and its predecessor hour
//! - rebuilds the rollup from retained input plus the new group
//! - skips the write when nothing changed (replays are no-ops)
//! - otherwise compare-and-swaps, re-reading and re-applying on conflict
//!
//! After a write, later hours that already exist are re-derived so that
//! cumulative counts and carried-open sessions converge no matter in which
//! order digests arrive. Each hour is written atomically; a digest aborted
//! mid-way leaves every hour either fully updated or untouched.

#[cfg(test)]
mod tests;

use crate::domain::error::{Diagnostic, DiagnosticKind, IngestError, StoreError};
use crate::domain::rollup::{HourKey, HourRollup};
use crate::domain::types::{hour_start, DeviceDigest, DeviceId, DeviceType};
use crate::infra::metrics::Metrics;
use crate::infra::registry::FacilityRegistry;
use crate::io::store::RollupStore;
use crate::services::look_builder;
use crate::services::move_builder;
use crate::services::normalizer::{HourGroup, NormalizedDigest, Normalizer};
use crate::services::occupancy::RollupSettings;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded exponential backoff for store conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(500),
        }
    }
}

/// Outcome of applying one digest
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub ingest_id: Uuid,
    pub device_id: DeviceId,
    pub diagnostics: Vec<Diagnostic>,
    /// Hours written directly from the digest's events
    pub written: Vec<HourKey>,
    /// Hours whose rebuild matched what was stored
    pub unchanged: usize,
    /// Later hours re-derived after a write
    pub reseeded: Vec<HourKey>,
    /// Hours halted by a configuration mismatch
    pub structural: Vec<IngestError>,
}

impl IngestReport {
    fn new(normalized: &NormalizedDigest) -> Self {
        Self {
            ingest_id: Uuid::now_v7(),
            device_id: normalized.device_id.clone(),
            diagnostics: normalized.diagnostics.clone(),
            written: Vec::new(),
            unchanged: 0,
            reseeded: Vec::new(),
            structural: Vec::new(),
        }
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }
}

/// Result of one write attempt loop on a single hour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HourWrite {
    Written(u64),
    Unchanged,
    Sealed,
    /// Nothing stored and creation not requested
    Missing,
}

enum Attempt {
    Done(HourWrite),
    Conflict,
}

pub struct RollupEngine {
    store: Arc<dyn RollupStore>,
    normalizer: Normalizer,
    settings: RollupSettings,
    retry: RetryPolicy,
    grace_period: TimeDelta,
    metrics: Arc<Metrics>,
}

impl RollupEngine {
    pub fn new(
        store: Arc<dyn RollupStore>,
        registry: Arc<FacilityRegistry>,
        settings: RollupSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            normalizer: Normalizer::new(registry),
            settings,
            retry: RetryPolicy::default(),
            grace_period: TimeDelta::minutes(15),
            metrics,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_grace_period(mut self, grace_period: TimeDelta) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn store(&self) -> &Arc<dyn RollupStore> {
        &self.store
    }

    pub fn settings(&self) -> &RollupSettings {
        &self.settings
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn registry(&self) -> &FacilityRegistry {
        self.normalizer.registry()
    }

    /// Validate and group a digest, counting accepted/rejected events
    pub fn normalize(&self, digest: &DeviceDigest) -> NormalizedDigest {
        let normalized = self.normalizer.normalize(digest);
        self.metrics.record_events(
            normalized.accepted as u64,
            normalized.rejected() as u64,
            normalized.unregistered() as u64,
        );
        normalized
    }

    pub async fn ingest(&self, digest: &DeviceDigest) -> Result<IngestReport, IngestError> {
        let normalized = self.normalize(digest);
        self.apply(&normalized).await
    }

    /// Apply every hour group in chronological order
    ///
    /// Recoverable failures (exhausted retries, store outage) abort the digest;
    /// it is safe to apply the same digest again later. Structural failures
    /// stop only the affected hour and are collected on the report.
    pub async fn apply(&self, normalized: &NormalizedDigest) -> Result<IngestReport, IngestError> {
        let started = Instant::now();
        let mut report = IngestReport::new(normalized);

        for group in &normalized.groups {
            match self.update_hour(group, &mut report).await {
                Ok(()) => {}
                Err(e) if e.is_structural() => {
                    error!(
                        ingest_id = %report.ingest_id,
                        key = %group.key(),
                        error = %e,
                        "hour_halted"
                    );
                    self.metrics.record_structural_failure();
                    report.structural.push(e);
                }
                Err(e) => {
                    warn!(
                        ingest_id = %report.ingest_id,
                        key = %group.key(),
                        error = %e,
                        "digest_apply_aborted"
                    );
                    return Err(e);
                }
            }
        }

        self.metrics.record_digest_ingested(started.elapsed().as_micros() as u64);
        info!(
            ingest_id = %report.ingest_id,
            device_id = %report.device_id,
            hours = normalized.groups.len(),
            written = report.written.len(),
            unchanged = report.unchanged,
            reseeded = report.reseeded.len(),
            diagnostics = report.diagnostics.len(),
            structural = report.structural.len(),
            "digest_applied"
        );
        Ok(report)
    }

    async fn update_hour(&self, group: &HourGroup, report: &mut IngestReport) -> Result<(), IngestError> {
        let key = group.key();
        match self.write_hour(group, true).await? {
            HourWrite::Written(version) => {
                self.metrics.record_rollup_written();
                info!(
                    ingest_id = %report.ingest_id,
                    key = %key,
                    version,
                    events = group.events.len(),
                    "rollup_written"
                );
                report.written.push(key.clone());
                self.reseed_successors(&key, group.device_type, report).await?;
            }
            HourWrite::Unchanged => {
                self.metrics.record_rollup_unchanged();
                debug!(ingest_id = %report.ingest_id, key = %key, "rollup_unchanged");
                report.unchanged += 1;
            }
            HourWrite::Sealed => {
                self.metrics.record_sealed_hour_events(group.events.len() as u64);
                warn!(
                    ingest_id = %report.ingest_id,
                    key = %key,
                    events = group.events.len(),
                    "late_events_for_sealed_hour"
                );
                report.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::SealedHour,
                    format!("{} events for sealed hour {}", group.events.len(), key),
                ));
            }
            HourWrite::Missing => {}
        }
        Ok(())
    }

    /// Re-derive H+1, H+2, ... until an hour is missing, unchanged, or sealed
    async fn reseed_successors(
        &self,
        key: &HourKey,
        device_type: DeviceType,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let mut next = key.next();
        loop {
            let group = HourGroup::empty(next.device_id.clone(), device_type, next.hour_start);
            match self.write_hour(&group, false).await? {
                HourWrite::Written(version) => {
                    self.metrics.record_rollup_written();
                    debug!(ingest_id = %report.ingest_id, key = %next, version, "rollup_reseeded");
                    report.reseeded.push(next.clone());
                    next = next.next();
                }
                HourWrite::Sealed => {
                    warn!(ingest_id = %report.ingest_id, key = %next, "sealed_successor_not_reseeded");
                    return Ok(());
                }
                HourWrite::Unchanged | HourWrite::Missing => return Ok(()),
            }
        }
    }

    /// Read-build-swap with bounded retries on conflict
    async fn write_hour(&self, group: &HourGroup, create: bool) -> Result<HourWrite, IngestError> {
        let key = group.key();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_write_hour(&key, group, create).await? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Conflict if attempt >= self.retry.max_attempts => {
                    self.metrics.record_retries_exhausted();
                    error!(key = %key, attempts = attempt, "rollup_retries_exhausted");
                    return Err(IngestError::RetriesExhausted { key, attempts: attempt });
                }
                Attempt::Conflict => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rollup_write_conflict"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_write_hour(&self, key: &HourKey, group: &HourGroup, create: bool) -> Result<Attempt, IngestError> {
        let current = self.store.load(key).await?;
        match &current {
            None if !create => return Ok(Attempt::Done(HourWrite::Missing)),
            Some(stored) if stored.value.is_finalized() => return Ok(Attempt::Done(HourWrite::Sealed)),
            _ => {}
        }

        let predecessor = self.store.load(&key.previous()).await?.map(|v| v.value);
        let existing = current.as_ref().map(|v| &v.value);
        let built = self.build(key, existing, group, predecessor.as_ref())?;

        if existing == Some(&built) {
            return Ok(Attempt::Done(HourWrite::Unchanged));
        }

        let expected = current.as_ref().map(|v| v.version);
        match self.store.compare_and_swap(key, expected, built).await {
            Ok(version) => Ok(Attempt::Done(HourWrite::Written(version))),
            Err(StoreError::Conflict { .. }) => {
                self.metrics.record_store_conflict();
                Ok(Attempt::Conflict)
            }
        }
    }

    fn build(
        &self,
        key: &HourKey,
        existing: Option<&HourRollup>,
        group: &HourGroup,
        predecessor: Option<&HourRollup>,
    ) -> Result<HourRollup, IngestError> {
        if let Some(stored) = existing {
            if stored.device_type() != group.device_type {
                return Err(IngestError::DeviceTypeMismatch {
                    key: key.clone(),
                    stored: stored.device_type(),
                    digest: group.device_type,
                });
            }
        }

        match group.device_type {
            DeviceType::Look => look_builder::build_or_update(
                existing.and_then(HourRollup::as_look),
                group,
                predecessor.and_then(HourRollup::as_look),
                &self.settings,
            )
            .map(HourRollup::Look),
            DeviceType::Move => move_builder::build_or_update(
                existing.and_then(HourRollup::as_move),
                group,
                predecessor.and_then(HourRollup::as_move),
                &self.settings,
            )
            .map(HourRollup::Move),
        }
    }

    /// Seal every rollup whose hour ended at least one grace period before `now`
    ///
    /// Hours are sealed oldest first. Returns the sealed rollups so callers
    /// can publish them.
    pub async fn finalize_elapsed(&self, now: DateTime<Utc>) -> Result<Vec<HourRollup>, IngestError> {
        // hour + 1h + grace <= now  <=>  hour < start of the hour holding (now - grace)
        let cutoff = hour_start(now - self.grace_period);
        let mut keys = self.store.keys_before(cutoff).await?;
        keys.sort_by(|a, b| (a.hour_start, &a.device_id).cmp(&(b.hour_start, &b.device_id)));

        let mut sealed = Vec::new();
        for key in keys {
            if let Some(rollup) = self.seal(&key).await? {
                self.metrics.record_rollup_finalized();
                info!(key = %key, "rollup_finalized");
                sealed.push(rollup);
            }
        }
        Ok(sealed)
    }

    async fn seal(&self, key: &HourKey) -> Result<Option<HourRollup>, IngestError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let Some(current) = self.store.load(key).await? else {
                return Ok(None);
            };
            if current.value.is_finalized() {
                return Ok(None);
            }
            let mut rollup = current.value;
            rollup.set_finalized();
            match self.store.compare_and_swap(key, Some(current.version), rollup.clone()).await {
                Ok(_) => return Ok(Some(rollup)),
                Err(StoreError::Conflict { .. }) if attempt < self.retry.max_attempts => {
                    self.metrics.record_store_conflict();
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
                Err(StoreError::Conflict { .. }) => {
                    self.metrics.record_retries_exhausted();
                    error!(key = %key, attempts = attempt, "finalize_retries_exhausted");
                    return Err(IngestError::RetriesExhausted { key: key.clone(), attempts: attempt });
                }
            }
        }
    }
}
