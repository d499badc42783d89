//! Look rollup builder
//!
//! Folds the person detections of one hour group into the retained
//! observation set of the hour, then recomputes every counter from that set.
//! Copies of the same `(session, person)` merge into one observation, so
//! resent or overlapping digests never double count.

use crate::domain::error::IngestError;
use crate::domain::rollup::{LookHourRollup, PersonObservation};
use crate::domain::types::{in_hour, PersonDetection, SensorEvent};
use crate::services::demographics::classify;
use crate::services::normalizer::{HourGroup, MAX_SESSION_SPAN};
use crate::services::occupancy::{occupancy_stats, BucketGrid, DwellStats, PresenceMarks, RollupSettings};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::btree_map::Entry;
use tracing::debug;

/// Apply `group` on top of `existing` (or a fresh rollup), carrying the
/// cumulative count and still-open sessions from `predecessor`
pub fn build_or_update(
    existing: Option<&LookHourRollup>,
    group: &HourGroup,
    predecessor: Option<&LookHourRollup>,
    settings: &RollupSettings,
) -> Result<LookHourRollup, IngestError> {
    let mut rollup = match existing {
        Some(existing) => {
            if existing.sample_buckets.len() != settings.bucket_count() {
                return Err(IngestError::BucketCountMismatch {
                    key: existing.key(),
                    stored: existing.sample_buckets.len(),
                    configured: settings.bucket_count(),
                });
            }
            existing.clone()
        }
        None => LookHourRollup::empty(group.device_id.clone(), group.hour_start, settings.bucket_count()),
    };

    for event in &group.events {
        if let SensorEvent::Person(person) = event {
            merge_detection(&mut rollup, person, group.observed_until);
        }
    }
    rollup.observed_until = rollup.observed_until.max(group.observed_until);

    recompute(&mut rollup, predecessor, settings);
    Ok(rollup)
}

/// Fold one detection into the retained observation for its person key
fn merge_detection(rollup: &mut LookHourRollup, person: &PersonDetection, observed_until: DateTime<Utc>) {
    let periods = person.time_periods.iter().copied();
    match rollup.observations.entry(person.key()) {
        Entry::Vacant(slot) => {
            slot.insert(PersonObservation {
                enter_time: person.enter_time,
                exit_time: person.exit_time,
                clean_exit: person.clean_exit,
                periods: periods.collect(),
                seen_until: observed_until.max(person.enter_time),
                age: person.age,
                age_confidence: person.age_confidence,
                gender: person.gender,
                gender_confidence: person.gender_confidence,
            });
        }
        Entry::Occupied(mut slot) => {
            let obs = slot.get_mut();
            obs.enter_time = obs.enter_time.min(person.enter_time);
            obs.exit_time = obs.exit_time.max(person.exit_time);
            obs.clean_exit |= person.clean_exit;
            obs.periods.extend(periods);
            obs.seen_until = obs.seen_until.max(observed_until);
            if person.age_confidence.total_cmp(&obs.age_confidence).is_gt()
                || (person.age_confidence == obs.age_confidence && person.age.total_cmp(&obs.age).is_gt())
            {
                obs.age = person.age;
                obs.age_confidence = person.age_confidence;
            }
            if person.gender_confidence.total_cmp(&obs.gender_confidence).is_gt()
                || (person.gender_confidence == obs.gender_confidence && person.gender > obs.gender)
            {
                obs.gender = person.gender;
                obs.gender_confidence = person.gender_confidence;
            }
        }
    }
}

/// Recompute every derived counter from the retained observations
pub fn recompute(rollup: &mut LookHourRollup, predecessor: Option<&LookHourRollup>, settings: &RollupSettings) {
    let grid = BucketGrid::new(rollup.hour_start, settings);
    let hour_end = grid.hour_end();
    let mut buckets = vec![0u32; settings.bucket_count()];
    let mut marks = PresenceMarks::new(&grid);
    let mut dwell = DwellStats::default();

    rollup.entrances = 0;
    rollup.exits = 0;
    rollup.active = 0;
    rollup.passive = 0;
    rollup.demographics = Default::default();
    rollup.dwell_tracking.clear();

    for (key, obs) in &rollup.observations {
        let end = obs.presence_end();
        if obs.enter_time >= hour_end || end < rollup.hour_start {
            continue;
        }

        if in_hour(obs.enter_time, rollup.hour_start) {
            rollup.entrances += 1;
            rollup.demographics.merge(&classify(obs, settings));
        }

        match obs.exit_time {
            Some(exit) if in_hour(exit, rollup.hour_start) => {
                rollup.exits += 1;
                let session = session_dwell(obs);
                dwell.record(session);
                if session >= settings.active_dwell {
                    rollup.active += 1;
                } else {
                    rollup.passive += 1;
                }
            }
            Some(exit) if exit < rollup.hour_start => {}
            _ => {
                rollup.dwell_tracking.insert(key.clone(), obs.enter_time);
            }
        }

        for (start, stop) in obs.resolved_periods() {
            marks.mark(start, stop);
        }
        marks.flush_into(&mut buckets);
    }

    // Sessions the predecessor left open stay present until a detection for them arrives
    if let Some(prev) = predecessor {
        let observed_until = rollup.observed_until.max(rollup.hour_start);
        for (key, entered) in &prev.dwell_tracking {
            if rollup.observations.contains_key(key) || rollup.hour_start - *entered > MAX_SESSION_SPAN {
                continue;
            }
            rollup.dwell_tracking.insert(key.clone(), *entered);
            marks.mark(rollup.hour_start, observed_until);
            marks.flush_into(&mut buckets);
        }
    }

    rollup.delta = i64::from(rollup.entrances) - i64::from(rollup.exits);
    rollup.cumulative = predecessor.map_or(0, |p| p.cumulative) + rollup.delta;

    let stats = occupancy_stats(&buckets);
    rollup.sample_buckets = buckets;
    rollup.occupancy_max = stats.max;
    rollup.occupancy_minute_samples_total = stats.samples_total;
    rollup.occupancy_sample_count = stats.sample_count;
    rollup.longest_dwell_secs = dwell.longest_secs;
    rollup.dwell_times_total_secs = dwell.total_secs;
    rollup.dwell_times_sample_count = dwell.count;

    debug!(
        device_id = %rollup.device_id,
        hour = %rollup.hour_start,
        persons = rollup.observations.len(),
        entrances = rollup.entrances,
        exits = rollup.exits,
        cumulative = rollup.cumulative,
        "look_rollup_recomputed"
    );
}

/// Time actually present: the sum of the coalesced periods
fn session_dwell(obs: &PersonObservation) -> TimeDelta {
    obs.resolved_periods()
        .into_iter()
        .fold(TimeDelta::zero(), |acc, (start, stop)| acc + (stop - start))
}
