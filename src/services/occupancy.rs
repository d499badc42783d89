//! Occupancy buckets and dwell statistics shared by the Look and Move builders
//!
//! An hour is split into `bucket_count` equal buckets. Presence intervals are
//! half-open `[start, end)`: someone leaving at 10:47:00 is not counted in the
//! 10:47 bucket. A zero-length interval counts in the bucket holding its start.

use crate::domain::error::IngestError;
use crate::domain::types::HOUR;
use chrono::{DateTime, TimeDelta, Utc};

const HOUR_MS: i64 = 3_600_000;

/// Parameters every rollup builder needs
#[derive(Debug, Clone, PartialEq)]
pub struct RollupSettings {
    bucket_count: usize,
    /// Completed sessions at least this long count as active
    pub active_dwell: TimeDelta,
    pub age_confidence_min: f32,
    pub gender_confidence_min: f32,
}

impl RollupSettings {
    pub fn new(
        bucket_count: usize,
        active_dwell_secs: i64,
        age_confidence_min: f32,
        gender_confidence_min: f32,
    ) -> Result<Self, IngestError> {
        if bucket_count == 0 || 3600 % bucket_count != 0 {
            return Err(IngestError::InvalidSettings(format!(
                "bucket_count {} must be positive and divide 3600",
                bucket_count
            )));
        }
        Ok(Self {
            bucket_count,
            active_dwell: TimeDelta::seconds(active_dwell_secs.max(0)),
            age_confidence_min,
            gender_confidence_min,
        })
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn bucket_width(&self) -> TimeDelta {
        TimeDelta::milliseconds(HOUR_MS / self.bucket_count as i64)
    }
}

impl Default for RollupSettings {
    /// One-minute buckets
    fn default() -> Self {
        Self {
            bucket_count: 60,
            active_dwell: TimeDelta::seconds(5),
            age_confidence_min: 0.5,
            gender_confidence_min: 0.5,
        }
    }
}

/// Bucket layout of one hour
#[derive(Debug, Clone, Copy)]
pub struct BucketGrid {
    hour_start: DateTime<Utc>,
    width_ms: i64,
    count: usize,
}

impl BucketGrid {
    pub fn new(hour_start: DateTime<Utc>, settings: &RollupSettings) -> Self {
        Self {
            hour_start,
            width_ms: HOUR_MS / settings.bucket_count as i64,
            count: settings.bucket_count,
        }
    }

    #[inline]
    pub fn hour_start(&self) -> DateTime<Utc> {
        self.hour_start
    }

    #[inline]
    pub fn hour_end(&self) -> DateTime<Utc> {
        self.hour_start + HOUR
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Index range of the buckets an interval occupies, if it touches this hour
    pub fn span(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<(usize, usize)> {
        let start_ms = (start - self.hour_start).num_milliseconds();
        let end_ms = (end.max(start) - self.hour_start).num_milliseconds();

        if start_ms == end_ms {
            return (0..HOUR_MS)
                .contains(&start_ms)
                .then(|| ((start_ms / self.width_ms) as usize, (start_ms / self.width_ms) as usize));
        }
        if start_ms >= HOUR_MS || end_ms <= 0 {
            return None;
        }
        let first = (start_ms.max(0) / self.width_ms) as usize;
        let last = ((end_ms.min(HOUR_MS) - 1) / self.width_ms) as usize;
        Some((first, last.min(self.count - 1)))
    }
}

/// Per-subject bucket marks; each subject adds at most one per bucket
pub struct PresenceMarks<'a> {
    grid: &'a BucketGrid,
    marks: Vec<bool>,
}

impl<'a> PresenceMarks<'a> {
    pub fn new(grid: &'a BucketGrid) -> Self {
        Self { grid, marks: vec![false; grid.count] }
    }

    pub fn mark(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        if let Some((first, last)) = self.grid.span(start, end) {
            self.marks[first..=last].iter_mut().for_each(|m| *m = true);
        }
    }

    /// Add this subject's marks to the buckets and reset for the next subject
    pub fn flush_into(&mut self, buckets: &mut [u32]) {
        for (bucket, mark) in buckets.iter_mut().zip(self.marks.iter_mut()) {
            if *mark {
                *bucket += 1;
                *mark = false;
            }
        }
    }
}

/// Derived occupancy figures for a bucket vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OccupancyStats {
    pub max: u32,
    pub samples_total: u64,
    pub sample_count: u32,
}

pub fn occupancy_stats(buckets: &[u32]) -> OccupancyStats {
    buckets.iter().fold(OccupancyStats::default(), |mut acc, &b| {
        acc.max = acc.max.max(b);
        acc.samples_total += u64::from(b);
        if b > 0 {
            acc.sample_count += 1;
        }
        acc
    })
}

/// Running dwell statistics over completed sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DwellStats {
    pub longest_secs: i64,
    pub total_secs: i64,
    pub count: u32,
}

impl DwellStats {
    #[inline]
    pub fn record(&mut self, dwell: TimeDelta) {
        let secs = dwell.num_seconds().max(0);
        self.longest_secs = self.longest_secs.max(secs);
        self.total_secs += secs;
        self.count += 1;
    }
}
