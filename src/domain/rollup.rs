//! Hourly rollup records
//!
//! Each rollup keeps two things side by side:
//! - the retained, deduplicated raw input for its hour (skipped on serialize)
//! - the derived counters, always recomputed from that retained input
//!
//! Recomputing from the retained set is what makes replays and overlapping
//! digests converge on the same record.

use crate::domain::types::{
    DeviceId, DeviceType, Gender, ObjectId, PersonKey, TimePeriod, TriggerId, TriggerType, HOUR,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Storage key of one device-hour
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HourKey {
    pub device_id: DeviceId,
    pub hour_start: DateTime<Utc>,
}

impl HourKey {
    pub fn new(device_id: DeviceId, hour_start: DateTime<Utc>) -> Self {
        Self { device_id, hour_start }
    }

    pub fn previous(&self) -> Self {
        Self { device_id: self.device_id.clone(), hour_start: self.hour_start - HOUR }
    }

    pub fn next(&self) -> Self {
        Self { device_id: self.device_id.clone(), hour_start: self.hour_start + HOUR }
    }
}

impl std::fmt::Display for HourKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.device_id, self.hour_start.format("%Y-%m-%dT%H:00Z"))
    }
}

/// Demographic tallies, one increment per unique person
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demographics {
    pub male: u32,
    pub female: u32,
    pub gender_unknown: u32,
    pub child: u32,
    pub teen: u32,
    pub young_adult: u32,
    pub middle_aged: u32,
    pub senior: u32,
    pub age_unknown: u32,
    pub gen_alpha: u32,
    pub gen_z: u32,
    pub millennial: u32,
    pub gen_x: u32,
    pub boomer: u32,
    pub silent: u32,
}

impl Demographics {
    pub fn merge(&mut self, other: &Demographics) {
        self.male += other.male;
        self.female += other.female;
        self.gender_unknown += other.gender_unknown;
        self.child += other.child;
        self.teen += other.teen;
        self.young_adult += other.young_adult;
        self.middle_aged += other.middle_aged;
        self.senior += other.senior;
        self.age_unknown += other.age_unknown;
        self.gen_alpha += other.gen_alpha;
        self.gen_z += other.gen_z;
        self.millennial += other.millennial;
        self.gen_x += other.gen_x;
        self.boomer += other.boomer;
        self.silent += other.silent;
    }
}

/// Merged view of every copy of one person seen for this hour
#[derive(Debug, Clone, PartialEq)]
pub struct PersonObservation {
    pub enter_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub clean_exit: bool,
    pub periods: BTreeSet<TimePeriod>,
    /// Latest digest horizon that reported this person
    pub seen_until: DateTime<Utc>,
    pub age: f32,
    pub age_confidence: f32,
    pub gender: Gender,
    pub gender_confidence: f32,
}

impl PersonObservation {
    /// End of presence: the exit if known, otherwise the last horizon seen
    #[inline]
    pub fn presence_end(&self) -> DateTime<Utc> {
        self.exit_time.unwrap_or(self.seen_until).max(self.enter_time)
    }

    /// Periods with open ends resolved, sorted and coalesced
    pub fn resolved_periods(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.presence_end();
        let mut out: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::with_capacity(self.periods.len());
        for period in &self.periods {
            let stop = period.exit_time.unwrap_or(end).max(period.enter_time);
            match out.last_mut() {
                Some(last) if period.enter_time <= last.1 => last.1 = last.1.max(stop),
                _ => out.push((period.enter_time, stop)),
            }
        }
        if out.is_empty() {
            out.push((self.enter_time, end));
        }
        out
    }
}

/// Hourly summary for one Look device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookHourRollup {
    pub device_id: DeviceId,
    pub hour_start: DateTime<Utc>,
    /// Occupancy per sub-interval of the hour (width = 3600s / len)
    pub sample_buckets: Vec<u32>,
    /// Sessions still open at the end of this hour, by their enter time
    pub dwell_tracking: BTreeMap<PersonKey, DateTime<Utc>>,
    pub entrances: u32,
    pub exits: u32,
    pub delta: i64,
    pub cumulative: i64,
    pub occupancy_max: u32,
    pub occupancy_minute_samples_total: u64,
    pub occupancy_sample_count: u32,
    pub longest_dwell_secs: i64,
    pub dwell_times_total_secs: i64,
    pub dwell_times_sample_count: u32,
    pub demographics: Demographics,
    pub active: u32,
    pub passive: u32,
    pub observed_until: DateTime<Utc>,
    pub finalized: bool,
    #[serde(skip)]
    pub observations: BTreeMap<PersonKey, PersonObservation>,
}

impl LookHourRollup {
    pub fn empty(device_id: DeviceId, hour_start: DateTime<Utc>, bucket_count: usize) -> Self {
        Self {
            device_id,
            hour_start,
            sample_buckets: vec![0; bucket_count],
            dwell_tracking: BTreeMap::new(),
            entrances: 0,
            exits: 0,
            delta: 0,
            cumulative: 0,
            occupancy_max: 0,
            occupancy_minute_samples_total: 0,
            occupancy_sample_count: 0,
            longest_dwell_secs: 0,
            dwell_times_total_secs: 0,
            dwell_times_sample_count: 0,
            demographics: Demographics::default(),
            active: 0,
            passive: 0,
            observed_until: hour_start,
            finalized: false,
            observations: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> HourKey {
        HourKey::new(self.device_id.clone(), self.hour_start)
    }
}

/// What a retained Move event means for presence on its trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Transition {
    Enter,
    Leave,
    /// Crossing an internal border: traffic only
    Pass,
}

/// One retained Move event, deduplicated by value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransitionRecord {
    pub time: DateTime<Utc>,
    pub object_id: ObjectId,
    pub transition: Transition,
}

/// Counters shared by trigger rollups and camera presence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveCounters {
    pub sample_buckets: Vec<u32>,
    /// Objects still present at the end of this hour, by when they entered
    pub dwell_tracking: BTreeMap<ObjectId, DateTime<Utc>>,
    pub entrances: u32,
    pub exits: u32,
    pub delta: i64,
    pub cumulative: i64,
    pub internal_crossings: u32,
    pub occupancy_max: u32,
    pub occupancy_minute_samples_total: u64,
    pub occupancy_sample_count: u32,
    pub longest_dwell_secs: i64,
    pub dwell_times_total_secs: i64,
    pub dwell_times_sample_count: u32,
}

impl MoveCounters {
    pub fn empty(bucket_count: usize) -> Self {
        Self {
            sample_buckets: vec![0; bucket_count],
            dwell_tracking: BTreeMap::new(),
            entrances: 0,
            exits: 0,
            delta: 0,
            cumulative: 0,
            internal_crossings: 0,
            occupancy_max: 0,
            occupancy_minute_samples_total: 0,
            occupancy_sample_count: 0,
            longest_dwell_secs: 0,
            dwell_times_total_secs: 0,
            dwell_times_sample_count: 0,
        }
    }

    /// True when nothing needs to be carried into the next hour
    pub fn is_settled(&self) -> bool {
        self.cumulative == 0 && self.dwell_tracking.is_empty()
    }
}

/// Hourly summary for one border or hotspot of a Move device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerHourRollup {
    pub device_id: DeviceId,
    pub trigger_id: TriggerId,
    pub trigger_type: TriggerType,
    pub hour_start: DateTime<Utc>,
    /// False when the trigger is not in the facility's registered list
    pub registered: bool,
    #[serde(flatten)]
    pub counters: MoveCounters,
    #[serde(skip)]
    pub transitions: BTreeSet<TransitionRecord>,
}

impl TriggerHourRollup {
    pub fn empty(
        device_id: DeviceId,
        trigger_id: TriggerId,
        trigger_type: TriggerType,
        hour_start: DateTime<Utc>,
        bucket_count: usize,
    ) -> Self {
        Self {
            device_id,
            trigger_id,
            trigger_type,
            hour_start,
            registered: true,
            counters: MoveCounters::empty(bucket_count),
            transitions: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn matches(&self, trigger_type: TriggerType, trigger_id: &TriggerId) -> bool {
        self.trigger_type == trigger_type && &self.trigger_id == trigger_id
    }
}

/// In-camera presence derived from dwell pings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceHourRollup {
    #[serde(flatten)]
    pub counters: MoveCounters,
    #[serde(skip)]
    pub transitions: BTreeSet<TransitionRecord>,
}

impl PresenceHourRollup {
    pub fn empty(bucket_count: usize) -> Self {
        Self { counters: MoveCounters::empty(bucket_count), transitions: BTreeSet::new() }
    }
}

/// Hourly summary for one Move device: one entry per trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveHourRollup {
    pub device_id: DeviceId,
    pub hour_start: DateTime<Utc>,
    /// Sorted by (trigger_type, trigger_id)
    pub triggers: Vec<TriggerHourRollup>,
    pub presence: PresenceHourRollup,
    pub observed_until: DateTime<Utc>,
    pub finalized: bool,
}

impl MoveHourRollup {
    pub fn empty(device_id: DeviceId, hour_start: DateTime<Utc>, bucket_count: usize) -> Self {
        Self {
            device_id,
            hour_start,
            triggers: Vec::new(),
            presence: PresenceHourRollup::empty(bucket_count),
            observed_until: hour_start,
            finalized: false,
        }
    }

    pub fn key(&self) -> HourKey {
        HourKey::new(self.device_id.clone(), self.hour_start)
    }

    pub fn trigger(&self, trigger_type: TriggerType, trigger_id: &TriggerId) -> Option<&TriggerHourRollup> {
        self.triggers.iter().find(|t| t.matches(trigger_type, trigger_id))
    }

    /// Get or insert the rollup for a trigger, keeping `triggers` sorted
    pub fn trigger_mut(
        &mut self,
        trigger_type: TriggerType,
        trigger_id: &TriggerId,
        bucket_count: usize,
    ) -> &mut TriggerHourRollup {
        let idx = match self
            .triggers
            .binary_search_by(|t| (t.trigger_type, &t.trigger_id).cmp(&(trigger_type, trigger_id)))
        {
            Ok(idx) => idx,
            Err(idx) => {
                self.triggers.insert(
                    idx,
                    TriggerHourRollup::empty(
                        self.device_id.clone(),
                        trigger_id.clone(),
                        trigger_type,
                        self.hour_start,
                        bucket_count,
                    ),
                );
                idx
            }
        };
        &mut self.triggers[idx]
    }
}

/// A stored device-hour rollup of either sensor family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "device_type", rename_all = "lowercase")]
pub enum HourRollup {
    Look(LookHourRollup),
    Move(MoveHourRollup),
}

impl HourRollup {
    pub fn device_type(&self) -> DeviceType {
        match self {
            HourRollup::Look(_) => DeviceType::Look,
            HourRollup::Move(_) => DeviceType::Move,
        }
    }

    pub fn key(&self) -> HourKey {
        match self {
            HourRollup::Look(r) => r.key(),
            HourRollup::Move(r) => r.key(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        match self {
            HourRollup::Look(r) => r.finalized,
            HourRollup::Move(r) => r.finalized,
        }
    }

    pub fn set_finalized(&mut self) {
        match self {
            HourRollup::Look(r) => r.finalized = true,
            HourRollup::Move(r) => r.finalized = true,
        }
    }

    /// Length of the occupancy bucket vectors this rollup was built with
    pub fn bucket_count(&self) -> usize {
        match self {
            HourRollup::Look(r) => r.sample_buckets.len(),
            HourRollup::Move(r) => r.presence.counters.sample_buckets.len(),
        }
    }

    pub fn as_look(&self) -> Option<&LookHourRollup> {
        match self {
            HourRollup::Look(r) => Some(r),
            HourRollup::Move(_) => None,
        }
    }

    pub fn as_move(&self) -> Option<&MoveHourRollup> {
        match self {
            HourRollup::Move(r) => Some(r),
            HourRollup::Look(_) => None,
        }
    }
}

/// Facility-wide traffic for one hour
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacilityTotals {
    pub entrances: u32,
    pub exits: u32,
    pub delta: i64,
    pub cumulative: i64,
    pub internal_crossings: u32,
    pub occupancy_max: u32,
    pub demographics: Demographics,
}

/// All device rollups of one facility for one hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityHourReport {
    pub facility_id: String,
    pub hour_start: DateTime<Utc>,
    pub look: Vec<LookHourRollup>,
    pub moves: Vec<MoveHourRollup>,
    pub totals: FacilityTotals,
    /// Requested devices with no rollup and no registered type
    pub unknown_devices: Vec<DeviceId>,
}
