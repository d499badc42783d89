//! End-to-end rollup scenarios through the public engine API

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use facility_rollup::domain::rollup::{HourKey, HourRollup, LookHourRollup, MoveHourRollup};
use facility_rollup::domain::types::{
    BorderCrossing, BorderDirection, DeviceDigest, DeviceId, DeviceType, DwellKind, DwellPing, Gender,
    Interpretation, ObjectId, PersonDetection, SensorEvent, TimePeriod, TriggerId, TriggerType,
};
use facility_rollup::infra::{FacilityRegistry, Metrics};
use facility_rollup::io::{MemoryRollupStore, RollupStore};
use facility_rollup::services::{FacilityCombiner, RollupEngine, RollupSettings, TallyTracker, TallyWindows};
use smallvec::SmallVec;
use std::sync::Arc;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, h, m, 0).unwrap()
}

struct Site {
    engine: RollupEngine,
    store: Arc<MemoryRollupStore>,
    registry: Arc<FacilityRegistry>,
}

fn site() -> Site {
    let mut registry = FacilityRegistry::new();
    registry.register("mall", DeviceId::new("look-1"), DeviceType::Look, [], []);
    registry.register(
        "mall",
        DeviceId::new("move-1"),
        DeviceType::Move,
        [TriggerId::new("door"), TriggerId::new("aisle")],
        [],
    );
    let registry = Arc::new(registry);
    let store = Arc::new(MemoryRollupStore::new());
    let engine = RollupEngine::new(
        store.clone(),
        registry.clone(),
        RollupSettings::default(),
        Arc::new(Metrics::new()),
    );
    Site { engine, store, registry }
}

fn digest(device: &str, device_type: DeviceType, min: DateTime<Utc>, max: DateTime<Utc>) -> DeviceDigest {
    DeviceDigest {
        device_id: DeviceId::new(device),
        device_type,
        collection_time: max,
        time_min: min,
        time_max: max,
        person_detections: vec![],
        border_crossings: vec![],
        hotspot_crossings: vec![],
        dwell_pings: vec![],
    }
}

fn person(id: i64, periods: &[(DateTime<Utc>, Option<DateTime<Utc>>)], exit: Option<DateTime<Utc>>) -> PersonDetection {
    PersonDetection {
        person_id: id,
        session_id: "session-1".to_string(),
        enter_time: periods[0].0,
        exit_time: exit,
        clean_exit: exit.is_some(),
        time_periods: periods
            .iter()
            .map(|&(enter_time, exit_time)| TimePeriod { enter_time, exit_time })
            .collect::<SmallVec<_>>(),
        age: 40.0,
        age_confidence: 0.9,
        gender: Gender::Male,
        gender_confidence: 0.9,
    }
}

fn border(id: &str, outer: bool, direction: BorderDirection, object: i64, time: DateTime<Utc>) -> BorderCrossing {
    BorderCrossing {
        border_id: TriggerId::new(id),
        direction,
        interpretation: if outer { Interpretation::Entrance } else { Interpretation::Internal },
        is_outer_border: outer,
        object_id: ObjectId(object),
        time,
    }
}

async fn look(store: &MemoryRollupStore, hour: DateTime<Utc>) -> LookHourRollup {
    let key = HourKey::new(DeviceId::new("look-1"), hour);
    store.load(&key).await.unwrap().unwrap().value.as_look().unwrap().clone()
}

async fn moves(store: &MemoryRollupStore, hour: DateTime<Utc>) -> MoveHourRollup {
    let key = HourKey::new(DeviceId::new("move-1"), hour);
    store.load(&key).await.unwrap().unwrap().value.as_move().unwrap().clone()
}

#[tokio::test]
async fn test_single_visit_fills_its_minutes() {
    let site = site();
    let mut d = digest("look-1", DeviceType::Look, at(10, 0), at(11, 0));
    d.person_detections = vec![person(1, &[(at(10, 2), Some(at(10, 47)))], Some(at(10, 47)))];
    site.engine.ingest(&d).await.unwrap();

    let r = look(&site.store, at(10, 0)).await;
    assert_eq!((r.entrances, r.exits, r.delta, r.cumulative), (1, 1, 0, 0));
    for (minute, &count) in r.sample_buckets.iter().enumerate() {
        let expected = u32::from((2..47).contains(&minute));
        assert_eq!(count, expected, "minute {minute}");
    }
    assert_eq!(r.occupancy_max, 1);
    assert_eq!(r.occupancy_minute_samples_total, 45);
    assert_eq!(r.occupancy_sample_count, 45);
    assert_eq!(r.longest_dwell_secs, 45 * 60);
    assert_eq!(r.demographics.male, 1);
    assert_eq!(r.active, 1);
}

#[tokio::test]
async fn test_same_digest_twice_leaves_rollup_unchanged() {
    let site = site();
    let mut d = digest("look-1", DeviceType::Look, at(10, 0), at(11, 0));
    d.person_detections = vec![
        person(1, &[(at(10, 2), Some(at(10, 47)))], Some(at(10, 47))),
        person(2, &[(at(10, 30), None)], None),
    ];

    site.engine.ingest(&d).await.unwrap();
    let first = site.store.snapshot();
    let report = site.engine.ingest(&d).await.unwrap();

    assert!(report.written.is_empty());
    assert_eq!(site.store.snapshot(), first);
}

#[tokio::test]
async fn test_overlapping_subwindow_is_idempotent() {
    let site = site();
    let mut full = digest("move-1", DeviceType::Move, at(9, 0), at(11, 0));
    full.border_crossings = vec![
        border("door", true, BorderDirection::LeftToRight, 1, at(9, 10)),
        border("door", true, BorderDirection::LeftToRight, 2, at(9, 40)),
        border("door", true, BorderDirection::RightToLeft, 1, at(10, 20)),
    ];
    let mut tail = digest("move-1", DeviceType::Move, at(9, 30), at(10, 30));
    tail.border_crossings = full.border_crossings[1..].to_vec();

    site.engine.ingest(&full).await.unwrap();
    let once = site.store.snapshot();
    site.engine.ingest(&tail).await.unwrap();
    site.engine.ingest(&full).await.unwrap();
    assert_eq!(site.store.snapshot(), once);
}

#[tokio::test]
async fn test_border_crossing_hour_boundary_carries_forward() {
    let site = site();
    let mut d = digest("move-1", DeviceType::Move, at(9, 50), at(10, 10));
    d.border_crossings = vec![
        border("door", true, BorderDirection::LeftToRight, 5, at(9, 58)),
        border("door", true, BorderDirection::RightToLeft, 5, at(10, 5)),
    ];
    site.engine.ingest(&d).await.unwrap();

    let nine = moves(&site.store, at(9, 0)).await;
    let door9 = &nine.trigger(TriggerType::Border, &TriggerId::new("door")).unwrap().counters;
    assert_eq!((door9.entrances, door9.exits, door9.cumulative), (1, 0, 1));

    let ten = moves(&site.store, at(10, 0)).await;
    let door10 = &ten.trigger(TriggerType::Border, &TriggerId::new("door")).unwrap().counters;
    assert_eq!((door10.entrances, door10.exits, door10.cumulative), (0, 1, 0));
    assert_eq!(door10.longest_dwell_secs, 7 * 60);
}

#[tokio::test]
async fn test_repeated_person_counts_once() {
    let site = site();
    let mut d = digest("look-1", DeviceType::Look, at(10, 0), at(11, 0));
    d.person_detections = vec![
        person(7, &[(at(10, 5), Some(at(10, 20)))], None),
        person(7, &[(at(10, 5), Some(at(10, 20))), (at(10, 15), Some(at(10, 30)))], None),
        person(7, &[(at(10, 5), Some(at(10, 20))), (at(10, 25), Some(at(10, 40)))], Some(at(10, 40))),
    ];
    site.engine.ingest(&d).await.unwrap();

    let r = look(&site.store, at(10, 0)).await;
    assert_eq!((r.entrances, r.exits), (1, 1));
    assert_eq!(r.demographics.male, 1);
    assert_eq!(r.occupancy_max, 1);
    assert_eq!(r.occupancy_sample_count, 35);
}

#[tokio::test]
async fn test_cumulative_holds_across_hours_in_any_order() {
    let site = site();
    let hours = [(13, vec![(1, 13, 5, Some((14, 10))), (2, 13, 30, None)]), (14, vec![(3, 14, 20, Some((14, 50)))])];

    // Hour 14 arrives before hour 13
    for (hour, visits) in hours.iter().rev() {
        let mut d = digest("look-1", DeviceType::Look, at(*hour, 0), at(*hour, 59));
        d.person_detections = visits
            .iter()
            .map(|&(id, h, m, exit)| {
                let exit = exit.map(|(eh, em)| at(eh, em));
                person(id, &[(at(h, m), exit)], exit)
            })
            .collect();
        site.engine.ingest(&d).await.unwrap();
    }

    let mut previous = 0;
    for hour in [13, 14] {
        let r = look(&site.store, at(hour, 0)).await;
        assert_eq!(r.cumulative, previous + i64::from(r.entrances) - i64::from(r.exits));
        previous = r.cumulative;
    }
    assert_eq!(previous, 1);
}

#[tokio::test]
async fn test_occupancy_max_matches_buckets() {
    let site = site();
    let mut d = digest("move-1", DeviceType::Move, at(10, 0), at(10, 59));
    for object in 0..12 {
        let enter = at(10, object as u32 * 3);
        d.border_crossings.push(border("door", true, BorderDirection::LeftToRight, object, enter));
        d.border_crossings
            .push(border("door", true, BorderDirection::RightToLeft, object, enter + TimeDelta::minutes(10)));
        d.dwell_pings.push(DwellPing { object_id: ObjectId(object), kind: DwellKind::Detected, time: enter });
    }
    site.engine.ingest(&d).await.unwrap();

    for rollup in site.store.snapshot() {
        let HourRollup::Move(m) = rollup else { panic!("expected a move rollup") };
        let mut counters = vec![&m.presence.counters];
        counters.extend(m.triggers.iter().map(|t| &t.counters));
        for c in counters {
            assert_eq!(c.occupancy_max, c.sample_buckets.iter().copied().max().unwrap_or(0));
        }
    }
    let door = moves(&site.store, at(10, 0)).await;
    assert_eq!(door.trigger(TriggerType::Border, &TriggerId::new("door")).unwrap().counters.occupancy_max, 4);
}

#[tokio::test]
async fn test_facility_report_combines_devices() {
    let site = site();
    let mut look_digest = digest("look-1", DeviceType::Look, at(10, 0), at(10, 59));
    look_digest.person_detections = vec![
        person(1, &[(at(10, 1), Some(at(10, 9)))], Some(at(10, 9))),
        person(2, &[(at(10, 5), None)], None),
    ];
    let mut move_digest = digest("move-1", DeviceType::Move, at(10, 0), at(10, 59));
    move_digest.border_crossings = vec![
        border("door", true, BorderDirection::LeftToRight, 1, at(10, 2)),
        border("aisle", false, BorderDirection::LeftToRight, 1, at(10, 3)),
        border("aisle", false, BorderDirection::RightToLeft, 1, at(10, 4)),
    ];
    site.engine.ingest(&look_digest).await.unwrap();
    site.engine.ingest(&move_digest).await.unwrap();

    let combiner = FacilityCombiner::new(site.store.clone(), site.registry.clone(), 60);
    let report = combiner.combine_facility("mall", at(10, 0)).await.unwrap();

    assert_eq!(report.look.len(), 1);
    assert_eq!(report.moves.len(), 1);
    assert_eq!((report.totals.entrances, report.totals.exits), (3, 1));
    assert_eq!(report.totals.internal_crossings, 1);
    assert_eq!(report.totals.cumulative, 2);
    assert_eq!(report.totals.demographics.male, 2);

    // An hour with no data is a zeroed report, not an error
    let empty = combiner.combine_facility("mall", at(3, 0)).await.unwrap();
    assert_eq!(empty.totals.entrances, 0);
    assert_eq!(empty.look.len() + empty.moves.len(), 2);
}

#[test]
fn test_tally_fifteen_minute_boundary() {
    let tracker = TallyTracker::new(TallyWindows::default());
    let device = DeviceId::new("move-1");
    let now = at(12, 0);
    let ping = |object, time| SensorEvent::Dwell(DwellPing { object_id: ObjectId(object), kind: DwellKind::Detected, time });

    tracker.record_event(&device, &ping(1, now - TimeDelta::minutes(15)), now);
    tracker.record_event(&device, &ping(2, now - TimeDelta::minutes(15) - TimeDelta::seconds(1)), now);

    let tally = tracker.snapshot(&device).unwrap();
    assert_eq!(tally.tally_15m, 1);
    assert_eq!(tally.tally_60m, 2);
}
