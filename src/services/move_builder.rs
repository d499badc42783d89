//! Move rollup builder
//!
//! Every crossing becomes a `TransitionRecord` on its trigger (or on the
//! device presence rollup for dwell pings). Records are kept as a set, so a
//! resent crossing is absorbed, and counters are recomputed from the set.
//!
//! Border mapping (outer borders only; internal borders are traffic):
//!
//! | interpretation       | LeftToRight | RightToLeft |
//! |----------------------|-------------|-------------|
//! | Entrance/None/Internal | Entrance  | Egress      |
//! | Egress               | Egress      | Entrance    |

use crate::domain::error::IngestError;
use crate::domain::rollup::{HourKey, MoveCounters, MoveHourRollup, Transition, TransitionRecord};
use crate::domain::types::{
    BorderCrossing, BorderDirection, DwellKind, HotspotDirection, Interpretation, ObjectId,
    SensorEvent, TriggerType,
};
use crate::services::normalizer::HourGroup;
use crate::services::occupancy::{occupancy_stats, BucketGrid, DwellStats, PresenceMarks, RollupSettings};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// What a border crossing means for the facility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMeaning {
    Entrance,
    Egress,
    Internal,
}

pub fn border_meaning(
    is_outer_border: bool,
    interpretation: Interpretation,
    direction: BorderDirection,
) -> BorderMeaning {
    if !is_outer_border {
        return BorderMeaning::Internal;
    }
    let inward_left_to_right = !matches!(interpretation, Interpretation::Egress);
    match (direction, inward_left_to_right) {
        (BorderDirection::LeftToRight, true) | (BorderDirection::RightToLeft, false) => {
            BorderMeaning::Entrance
        }
        _ => BorderMeaning::Egress,
    }
}

fn border_transition(crossing: &BorderCrossing) -> Transition {
    match border_meaning(crossing.is_outer_border, crossing.interpretation, crossing.direction) {
        BorderMeaning::Entrance => Transition::Enter,
        BorderMeaning::Egress => Transition::Leave,
        BorderMeaning::Internal => Transition::Pass,
    }
}

/// Apply `group` on top of `existing` (or a fresh rollup), carrying open
/// objects and cumulative counts from `predecessor`
pub fn build_or_update(
    existing: Option<&MoveHourRollup>,
    group: &HourGroup,
    predecessor: Option<&MoveHourRollup>,
    settings: &RollupSettings,
) -> Result<MoveHourRollup, IngestError> {
    let bucket_count = settings.bucket_count();
    let mut rollup = match existing {
        Some(existing) => {
            check_buckets(existing.key(), &existing.presence.counters, settings)?;
            for trigger in &existing.triggers {
                check_buckets(existing.key(), &trigger.counters, settings)?;
            }
            existing.clone()
        }
        None => MoveHourRollup::empty(group.device_id.clone(), group.hour_start, bucket_count),
    };

    for event in &group.events {
        let (trigger, record) = match event {
            SensorEvent::Border(b) => (
                Some((TriggerType::Border, &b.border_id)),
                TransitionRecord { time: b.time, object_id: b.object_id, transition: border_transition(b) },
            ),
            SensorEvent::Hotspot(h) => (
                Some((TriggerType::Hotspot, &h.hotspot_id)),
                TransitionRecord {
                    time: h.time,
                    object_id: h.object_id,
                    transition: match h.direction_type {
                        HotspotDirection::In => Transition::Enter,
                        HotspotDirection::Out => Transition::Leave,
                    },
                },
            ),
            SensorEvent::Dwell(d) => (
                None,
                TransitionRecord {
                    time: d.time,
                    object_id: d.object_id,
                    transition: match d.kind {
                        DwellKind::Detected => Transition::Enter,
                        DwellKind::Lost => Transition::Leave,
                    },
                },
            ),
            SensorEvent::Person(_) => continue,
        };

        match trigger {
            Some((trigger_type, trigger_id)) => {
                let registered = !group.is_unregistered(trigger_type, trigger_id);
                let rollup_trigger = rollup.trigger_mut(trigger_type, trigger_id, bucket_count);
                rollup_trigger.registered = registered;
                rollup_trigger.transitions.insert(record);
            }
            None => {
                rollup.presence.transitions.insert(record);
            }
        }
    }

    // Triggers with people still inside carry into this hour even without events
    if let Some(prev) = predecessor {
        for prev_trigger in prev.triggers.iter().filter(|t| !t.counters.is_settled()) {
            let registered = prev_trigger.registered;
            let created = rollup.trigger(prev_trigger.trigger_type, &prev_trigger.trigger_id).is_none();
            let carried = rollup.trigger_mut(prev_trigger.trigger_type, &prev_trigger.trigger_id, bucket_count);
            if created {
                carried.registered = registered;
            }
        }
    }

    rollup.observed_until = rollup.observed_until.max(group.observed_until);
    recompute(&mut rollup, predecessor, settings);
    Ok(rollup)
}

fn check_buckets(key: HourKey, counters: &MoveCounters, settings: &RollupSettings) -> Result<(), IngestError> {
    if counters.sample_buckets.len() != settings.bucket_count() {
        return Err(IngestError::BucketCountMismatch {
            key,
            stored: counters.sample_buckets.len(),
            configured: settings.bucket_count(),
        });
    }
    Ok(())
}

/// Recompute every trigger and the presence counters from retained transitions
pub fn recompute(rollup: &mut MoveHourRollup, predecessor: Option<&MoveHourRollup>, settings: &RollupSettings) {
    let grid = BucketGrid::new(rollup.hour_start, settings);
    let observed_until = rollup.observed_until;

    for trigger in &mut rollup.triggers {
        let prev = predecessor
            .and_then(|p| p.trigger(trigger.trigger_type, &trigger.trigger_id))
            .map(|t| &t.counters);
        trigger.counters = recompute_counters(&trigger.transitions, prev, &grid, observed_until);
    }
    rollup.presence.counters = recompute_counters(
        &rollup.presence.transitions,
        predecessor.map(|p| &p.presence.counters),
        &grid,
        observed_until,
    );

    debug!(
        device_id = %rollup.device_id,
        hour = %rollup.hour_start,
        triggers = rollup.triggers.len(),
        present = rollup.presence.counters.dwell_tracking.len(),
        "move_rollup_recomputed"
    );
}

/// Walk one trigger's transitions in time order
///
/// Objects still open in the predecessor are present from the start of the
/// hour. Enter/Leave pairs close an interval and record its dwell; objects
/// still open afterwards are carried on to the next hour.
fn recompute_counters(
    transitions: &BTreeSet<TransitionRecord>,
    prev: Option<&MoveCounters>,
    grid: &BucketGrid,
    observed_until: DateTime<Utc>,
) -> MoveCounters {
    let hour_start = grid.hour_start();
    let mut open: BTreeMap<ObjectId, DateTime<Utc>> =
        prev.map(|p| p.dwell_tracking.clone()).unwrap_or_default();
    let mut entered: BTreeSet<ObjectId> = BTreeSet::new();
    let mut exited: BTreeSet<ObjectId> = BTreeSet::new();
    let mut passed: BTreeSet<ObjectId> = BTreeSet::new();
    let mut intervals: BTreeMap<ObjectId, Vec<(DateTime<Utc>, DateTime<Utc>)>> = BTreeMap::new();
    let mut dwell = DwellStats::default();

    for record in transitions {
        match record.transition {
            Transition::Enter => {
                entered.insert(record.object_id);
                open.entry(record.object_id).or_insert(record.time);
            }
            Transition::Leave => {
                exited.insert(record.object_id);
                if let Some(since) = open.remove(&record.object_id) {
                    dwell.record(record.time - since);
                    intervals
                        .entry(record.object_id)
                        .or_default()
                        .push((since.max(hour_start), record.time));
                }
            }
            Transition::Pass => {
                passed.insert(record.object_id);
            }
        }
    }

    for (object_id, since) in &open {
        let start = (*since).max(hour_start);
        intervals.entry(*object_id).or_default().push((start, observed_until.max(start)));
    }

    let mut buckets = vec![0u32; grid.len()];
    let mut marks = PresenceMarks::new(grid);
    for spans in intervals.values() {
        for &(start, stop) in spans {
            marks.mark(start, stop);
        }
        marks.flush_into(&mut buckets);
    }

    let entrances = entered.len() as u32;
    let exits = exited.len() as u32;
    let delta = i64::from(entrances) - i64::from(exits);
    let stats = occupancy_stats(&buckets);

    MoveCounters {
        sample_buckets: buckets,
        dwell_tracking: open,
        entrances,
        exits,
        delta,
        cumulative: prev.map_or(0, |p| p.cumulative) + delta,
        internal_crossings: passed.len() as u32,
        occupancy_max: stats.max,
        occupancy_minute_samples_total: stats.samples_total,
        occupancy_sample_count: stats.sample_count,
        longest_dwell_secs: dwell.longest_secs,
        dwell_times_total_secs: dwell.total_secs,
        dwell_times_sample_count: dwell.count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BorderCrossing, DeviceId, DeviceType, DwellPing, HotspotCrossing, TriggerId};
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, 0).unwrap()
    }

    fn border(id: &str, object: i64, direction: BorderDirection, time: DateTime<Utc>) -> SensorEvent {
        SensorEvent::Border(BorderCrossing {
            border_id: TriggerId::new(id),
            direction,
            interpretation: Interpretation::Entrance,
            is_outer_border: id != "aisle",
            object_id: ObjectId(object),
            time,
        })
    }

    fn hotspot(object: i64, direction: HotspotDirection, time: DateTime<Utc>) -> SensorEvent {
        SensorEvent::Hotspot(HotspotCrossing {
            hotspot_id: TriggerId::new("till"),
            direction_type: direction,
            object_id: ObjectId(object),
            time,
        })
    }

    fn group(hour: DateTime<Utc>, events: Vec<SensorEvent>) -> HourGroup {
        HourGroup {
            device_id: DeviceId::new("move-1"),
            device_type: DeviceType::Move,
            hour_start: hour,
            observed_until: hour + crate::domain::types::HOUR,
            events,
            unregistered_triggers: Default::default(),
        }
    }

    fn door(r: &MoveHourRollup) -> &MoveCounters {
        &r.trigger(TriggerType::Border, &TriggerId::new("door")).unwrap().counters
    }

    #[test]
    fn test_border_mapping_table() {
        use BorderDirection::*;
        use BorderMeaning as M;
        let cases = [
            (true, Interpretation::Entrance, LeftToRight, M::Entrance),
            (true, Interpretation::Entrance, RightToLeft, M::Egress),
            (true, Interpretation::Egress, LeftToRight, M::Egress),
            (true, Interpretation::Egress, RightToLeft, M::Entrance),
            (true, Interpretation::None, LeftToRight, M::Entrance),
            (true, Interpretation::None, RightToLeft, M::Egress),
            (true, Interpretation::Internal, LeftToRight, M::Entrance),
            (true, Interpretation::Internal, RightToLeft, M::Egress),
            (false, Interpretation::Entrance, LeftToRight, M::Internal),
            (false, Interpretation::Egress, RightToLeft, M::Internal),
            (false, Interpretation::None, LeftToRight, M::Internal),
        ];
        for (outer, interpretation, direction, expected) in cases {
            assert_eq!(
                border_meaning(outer, interpretation, direction),
                expected,
                "outer={outer} {interpretation:?} {direction:?}"
            );
        }
    }

    #[test]
    fn test_border_across_hour_boundary() {
        let settings = RollupSettings::default();
        let nine = build_or_update(
            None,
            &group(at(9, 0), vec![border("door", 1, BorderDirection::LeftToRight, at(9, 58))]),
            None,
            &settings,
        )
        .unwrap();
        let ten = build_or_update(
            None,
            &group(at(10, 0), vec![border("door", 1, BorderDirection::RightToLeft, at(10, 5))]),
            Some(&nine),
            &settings,
        )
        .unwrap();

        assert_eq!((door(&nine).entrances, door(&nine).exits, door(&nine).cumulative), (1, 0, 1));
        assert_eq!(door(&nine).dwell_tracking.get(&ObjectId(1)), Some(&at(9, 58)));
        assert_eq!((door(&ten).entrances, door(&ten).exits, door(&ten).cumulative), (0, 1, 0));
        assert_eq!(door(&ten).longest_dwell_secs, 7 * 60);
        assert!(door(&ten).sample_buckets[..5].iter().all(|&b| b == 1));
        assert_eq!(door(&ten).sample_buckets[5], 0);
    }

    #[test]
    fn test_resent_crossings_absorbed() {
        let settings = RollupSettings::default();
        let events = vec![
            hotspot(1, HotspotDirection::In, at(10, 1)),
            hotspot(1, HotspotDirection::Out, at(10, 4)),
            hotspot(2, HotspotDirection::In, at(10, 2)),
        ];
        let once = build_or_update(None, &group(at(10, 0), events.clone()), None, &settings).unwrap();
        let twice = build_or_update(Some(&once), &group(at(10, 0), events), None, &settings).unwrap();
        assert_eq!(once, twice);

        let till = &once.trigger(TriggerType::Hotspot, &TriggerId::new("till")).unwrap().counters;
        assert_eq!((till.entrances, till.exits, till.delta), (2, 1, 1));
        assert_eq!(till.occupancy_max, 2);
        assert_eq!(till.dwell_tracking.len(), 1);
    }

    #[test]
    fn test_internal_border_only_traffic() {
        let settings = RollupSettings::default();
        let r = build_or_update(
            None,
            &group(
                at(10, 0),
                vec![
                    border("aisle", 1, BorderDirection::LeftToRight, at(10, 1)),
                    border("aisle", 1, BorderDirection::RightToLeft, at(10, 9)),
                    border("aisle", 2, BorderDirection::LeftToRight, at(10, 3)),
                ],
            ),
            None,
            &settings,
        )
        .unwrap();
        let aisle = &r.trigger(TriggerType::Border, &TriggerId::new("aisle")).unwrap().counters;
        assert_eq!(aisle.internal_crossings, 2);
        assert_eq!((aisle.entrances, aisle.exits, aisle.cumulative), (0, 0, 0));
        assert!(aisle.is_settled());
    }

    #[test]
    fn test_unsettled_trigger_carried_without_events() {
        let settings = RollupSettings::default();
        let nine = build_or_update(
            None,
            &group(at(9, 0), vec![border("door", 1, BorderDirection::LeftToRight, at(9, 30))]),
            None,
            &settings,
        )
        .unwrap();
        let ten = build_or_update(None, &group(at(10, 0), vec![]), Some(&nine), &settings).unwrap();
        assert_eq!(door(&ten).cumulative, 1);
        assert_eq!(door(&ten).dwell_tracking.len(), 1);
        assert!(door(&ten).sample_buckets.iter().all(|&b| b == 1));
    }

    #[test]
    fn test_presence_from_dwell_pings() {
        let settings = RollupSettings::default();
        let ping = |object, kind, time| SensorEvent::Dwell(DwellPing { object_id: ObjectId(object), kind, time });
        let r = build_or_update(
            None,
            &group(
                at(10, 0),
                vec![
                    ping(7, DwellKind::Detected, at(10, 10)),
                    ping(7, DwellKind::Detected, at(10, 12)),
                    ping(7, DwellKind::Lost, at(10, 20)),
                ],
            ),
            None,
            &settings,
        )
        .unwrap();
        assert!(r.triggers.is_empty());
        let presence = &r.presence.counters;
        assert_eq!((presence.entrances, presence.exits), (1, 1));
        assert_eq!(presence.longest_dwell_secs, 600);
        assert_eq!(presence.occupancy_minute_samples_total, 10);
    }

    #[test]
    fn test_unregistered_trigger_marked() {
        let settings = RollupSettings::default();
        let mut g = group(at(10, 0), vec![border("side", 1, BorderDirection::LeftToRight, at(10, 1))]);
        g.unregistered_triggers.insert((TriggerType::Border, TriggerId::new("side")));
        let r = build_or_update(None, &g, None, &settings).unwrap();
        assert!(!r.trigger(TriggerType::Border, &TriggerId::new("side")).unwrap().registered);
    }

    #[test]
    fn test_bucket_mismatch_on_stored_trigger() {
        let mut stored = MoveHourRollup::empty(DeviceId::new("move-1"), at(10, 0), 60);
        stored.trigger_mut(TriggerType::Border, &TriggerId::new("door"), 240);
        let err = build_or_update(Some(&stored), &group(at(10, 0), vec![]), None, &RollupSettings::default())
            .unwrap_err();
        assert!(matches!(err, IngestError::BucketCountMismatch { stored: 240, configured: 60, .. }));
    }
}
