//! Tests for the RollupEngine

use super::*;
use crate::domain::rollup::{LookHourRollup, MoveHourRollup};
use crate::domain::types::{
    BorderCrossing, BorderDirection, Gender, Interpretation, ObjectId, PersonDetection, PersonKey, TimePeriod,
    TriggerId, TriggerType,
};
use crate::io::store::{MemoryRollupStore, Versioned};
use async_trait::async_trait;
use chrono::TimeZone;
use smallvec::smallvec;
use std::sync::atomic::{AtomicU32, Ordering};

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, h, m, 0).unwrap()
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(2),
    }
}

fn registry() -> Arc<FacilityRegistry> {
    let mut registry = FacilityRegistry::new();
    registry.register("mall", DeviceId::new("look-1"), DeviceType::Look, [], []);
    registry.register("mall", DeviceId::new("move-1"), DeviceType::Move, [TriggerId::new("door")], []);
    Arc::new(registry)
}

struct Harness {
    engine: RollupEngine,
    store: Arc<MemoryRollupStore>,
    metrics: Arc<Metrics>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryRollupStore::new());
    let metrics = Arc::new(Metrics::new());
    let engine = RollupEngine::new(store.clone(), registry(), RollupSettings::default(), metrics.clone())
        .with_retry_policy(fast_retry(5))
        .with_grace_period(TimeDelta::minutes(15));
    Harness { engine, store, metrics }
}

fn look_digest(min: DateTime<Utc>, max: DateTime<Utc>, persons: Vec<PersonDetection>) -> DeviceDigest {
    DeviceDigest {
        device_id: DeviceId::new("look-1"),
        device_type: DeviceType::Look,
        collection_time: max,
        time_min: min,
        time_max: max,
        person_detections: persons,
        border_crossings: vec![],
        hotspot_crossings: vec![],
        dwell_pings: vec![],
    }
}

fn move_digest(min: DateTime<Utc>, max: DateTime<Utc>, crossings: Vec<BorderCrossing>) -> DeviceDigest {
    DeviceDigest {
        device_id: DeviceId::new("move-1"),
        device_type: DeviceType::Move,
        collection_time: max,
        time_min: min,
        time_max: max,
        person_detections: vec![],
        border_crossings: crossings,
        hotspot_crossings: vec![],
        dwell_pings: vec![],
    }
}

fn person(id: i64, enter: DateTime<Utc>, exit: Option<DateTime<Utc>>) -> PersonDetection {
    PersonDetection {
        person_id: id,
        session_id: "sess-a".to_string(),
        enter_time: enter,
        exit_time: exit,
        clean_exit: exit.is_some(),
        time_periods: smallvec![TimePeriod { enter_time: enter, exit_time: exit }],
        age: 28.0,
        age_confidence: 0.9,
        gender: Gender::Female,
        gender_confidence: 0.9,
    }
}

fn door(object: i64, direction: BorderDirection, time: DateTime<Utc>) -> BorderCrossing {
    BorderCrossing {
        border_id: TriggerId::new("door"),
        direction,
        interpretation: Interpretation::Entrance,
        is_outer_border: true,
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

fn door_cumulative(rollup: &MoveHourRollup) -> i64 {
    rollup.trigger(TriggerType::Border, &TriggerId::new("door")).unwrap().counters.cumulative
}

#[tokio::test]
async fn test_ingest_writes_rollup() {
    let h = harness();
    let digest = look_digest(at(10, 0), at(11, 0), vec![person(1, at(10, 2), Some(at(10, 47)))]);

    let report = h.engine.ingest(&digest).await.unwrap();
    assert_eq!(report.written, vec![HourKey::new(DeviceId::new("look-1"), at(10, 0))]);
    assert!(report.diagnostics.is_empty());

    let r = look(&h.store, at(10, 0)).await;
    assert_eq!((r.entrances, r.exits, r.delta, r.cumulative), (1, 1, 0, 0));
    assert_eq!(h.metrics.rollups_written(), 1);
}

#[tokio::test]
async fn test_replay_is_a_no_op() {
    let h = harness();
    let digest = look_digest(at(10, 0), at(11, 0), vec![person(1, at(10, 2), Some(at(10, 47)))]);

    h.engine.ingest(&digest).await.unwrap();
    let before = h.store.snapshot();
    let report = h.engine.ingest(&digest).await.unwrap();

    assert!(report.written.is_empty());
    assert_eq!(report.unchanged, 1);
    assert_eq!(h.store.snapshot(), before);
    let key = HourKey::new(DeviceId::new("look-1"), at(10, 0));
    assert_eq!(h.store.load(&key).await.unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn test_overlapping_subwindow_is_absorbed() {
    let h = harness();
    let full = look_digest(
        at(10, 0),
        at(11, 0),
        vec![person(1, at(10, 2), Some(at(10, 47))), person(2, at(10, 30), Some(at(10, 35)))],
    );
    let sub = look_digest(at(10, 25), at(10, 40), vec![person(2, at(10, 30), Some(at(10, 35)))]);

    h.engine.ingest(&full).await.unwrap();
    let before = h.store.snapshot();
    let report = h.engine.ingest(&sub).await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn test_out_of_order_converges() {
    let in_order = harness();
    let out_of_order = harness();
    let ten = move_digest(at(10, 0), at(11, 0), vec![door(1, BorderDirection::LeftToRight, at(10, 10))]);
    let eleven = move_digest(at(11, 0), at(12, 0), vec![door(2, BorderDirection::LeftToRight, at(11, 20))]);
    let twelve = move_digest(at(12, 0), at(13, 0), vec![door(1, BorderDirection::RightToLeft, at(12, 5))]);

    for d in [&ten, &eleven, &twelve] {
        in_order.engine.ingest(d).await.unwrap();
    }
    for d in [&twelve, &eleven, &ten] {
        out_of_order.engine.ingest(d).await.unwrap();
    }

    assert_eq!(in_order.store.snapshot(), out_of_order.store.snapshot());
    assert_eq!(door_cumulative(&moves(&out_of_order.store, at(10, 0)).await), 1);
    assert_eq!(door_cumulative(&moves(&out_of_order.store, at(11, 0)).await), 2);
    assert_eq!(door_cumulative(&moves(&out_of_order.store, at(12, 0)).await), 1);

    // Object 1 stayed from 10:10 to 12:05
    let twelve_rollup = moves(&out_of_order.store, at(12, 0)).await;
    let counters = &twelve_rollup.trigger(TriggerType::Border, &TriggerId::new("door")).unwrap().counters;
    assert_eq!(counters.longest_dwell_secs, 115 * 60);
}

#[tokio::test]
async fn test_reseed_reports_successors() {
    let h = harness();
    let eleven = look_digest(at(11, 0), at(12, 0), vec![person(2, at(11, 5), None)]);
    let ten = look_digest(at(10, 0), at(11, 0), vec![person(1, at(10, 5), None)]);

    h.engine.ingest(&eleven).await.unwrap();
    let report = h.engine.ingest(&ten).await.unwrap();
    assert_eq!(report.reseeded, vec![HourKey::new(DeviceId::new("look-1"), at(11, 0))]);
    assert_eq!(look(&h.store, at(11, 0)).await.cumulative, 2);
}

#[tokio::test]
async fn test_cumulative_chain_across_hours() {
    let h = harness();
    let digest = look_digest(
        at(9, 0),
        at(12, 0),
        vec![
            person(1, at(9, 10), Some(at(11, 30))),
            person(2, at(9, 20), None),
            person(3, at(10, 15), Some(at(10, 45))),
        ],
    );
    h.engine.ingest(&digest).await.unwrap();

    let mut previous = 0;
    for hour in [at(9, 0), at(10, 0), at(11, 0)] {
        let r = look(&h.store, hour).await;
        assert_eq!(r.cumulative, previous + i64::from(r.entrances) - i64::from(r.exits));
        previous = r.cumulative;
    }
    assert_eq!(previous, 1);
}

#[tokio::test]
async fn test_open_look_session_carried_into_next_hour() {
    let h = harness();
    let carried = PersonKey::new("sess-a", 1);
    h.engine
        .ingest(&look_digest(at(9, 0), at(10, 0), vec![person(1, at(9, 50), None)]))
        .await
        .unwrap();
    h.engine
        .ingest(&look_digest(at(10, 0), at(10, 30), vec![person(2, at(10, 5), Some(at(10, 15)))]))
        .await
        .unwrap();

    let nine = look(&h.store, at(9, 0)).await;
    assert_eq!(nine.dwell_tracking.keys().collect::<Vec<_>>(), vec![&carried]);

    let ten = look(&h.store, at(10, 0)).await;
    assert_eq!(ten.dwell_tracking.get(&carried), Some(&at(9, 50)));
    assert_eq!((ten.entrances, ten.exits, ten.cumulative), (1, 1, 1));
    assert_eq!(ten.sample_buckets[0], 1);
    assert_eq!(ten.sample_buckets[10], 2);
    assert_eq!(ten.sample_buckets[29], 1);
    assert_eq!(ten.sample_buckets[30], 0);

    // The exit replaces the carried entry
    h.engine
        .ingest(&look_digest(at(10, 0), at(10, 45), vec![person(1, at(9, 50), Some(at(10, 40)))]))
        .await
        .unwrap();
    let ten = look(&h.store, at(10, 0)).await;
    assert!(ten.dwell_tracking.is_empty());
    assert_eq!((ten.entrances, ten.exits, ten.cumulative), (1, 2, 0));
    assert_eq!(ten.sample_buckets[39], 1);
    assert_eq!(ten.sample_buckets[40], 0);
    assert_eq!(ten.longest_dwell_secs, 50 * 60);
}

struct ConflictingStore {
    inner: MemoryRollupStore,
    conflicts_left: AtomicU32,
}

#[async_trait]
impl RollupStore for ConflictingStore {
    async fn load(&self, key: &HourKey) -> Result<Option<Versioned<HourRollup>>, StoreError> {
        self.inner.load(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &HourKey,
        expected: Option<u64>,
        rollup: HourRollup,
    ) -> Result<u64, StoreError> {
        let injected = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict { key: key.clone(), expected, actual: expected.map(|v| v + 1) });
        }
        self.inner.compare_and_swap(key, expected, rollup).await
    }

    async fn keys_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<HourKey>, StoreError> {
        self.inner.keys_before(cutoff).await
    }
}

fn conflicting_engine(conflicts: u32, max_attempts: u32) -> (RollupEngine, Arc<Metrics>) {
    let store = Arc::new(ConflictingStore {
        inner: MemoryRollupStore::new(),
        conflicts_left: AtomicU32::new(conflicts),
    });
    let metrics = Arc::new(Metrics::new());
    let engine = RollupEngine::new(store, registry(), RollupSettings::default(), metrics.clone())
        .with_retry_policy(fast_retry(max_attempts));
    (engine, metrics)
}

#[tokio::test]
async fn test_conflicts_retried_then_written() {
    let (engine, metrics) = conflicting_engine(2, 5);
    let digest = look_digest(at(10, 0), at(11, 0), vec![person(1, at(10, 2), None)]);

    let report = engine.ingest(&digest).await.unwrap();
    assert_eq!(report.written.len(), 1);
    assert_eq!(metrics.store_conflicts(), 2);
}

#[tokio::test]
async fn test_retries_exhausted_is_recoverable() {
    let (engine, _metrics) = conflicting_engine(10, 3);
    let digest = look_digest(at(10, 0), at(11, 0), vec![person(1, at(10, 2), None)]);

    let err = engine.ingest(&digest).await.unwrap_err();
    assert!(matches!(err, IngestError::RetriesExhausted { attempts: 3, .. }));
    assert!(!err.is_structural());
}

#[tokio::test]
async fn test_bucket_mismatch_halts_only_that_hour() {
    let h = harness();
    let key = HourKey::new(DeviceId::new("look-1"), at(10, 0));
    let stale = HourRollup::Look(LookHourRollup::empty(DeviceId::new("look-1"), at(10, 0), 240));
    h.store.compare_and_swap(&key, None, stale).await.unwrap();

    let digest = look_digest(
        at(10, 0),
        at(12, 0),
        vec![person(1, at(10, 5), Some(at(10, 10))), person(2, at(11, 5), Some(at(11, 10)))],
    );
    let report = h.engine.ingest(&digest).await.unwrap();

    assert_eq!(report.structural.len(), 1);
    assert!(matches!(report.structural[0], IngestError::BucketCountMismatch { stored: 240, configured: 60, .. }));
    assert_eq!(report.written, vec![HourKey::new(DeviceId::new("look-1"), at(11, 0))]);
    assert_eq!(look(&h.store, at(10, 0)).await.sample_buckets.len(), 240);
}

#[tokio::test]
async fn test_stored_type_mismatch_is_structural() {
    let h = harness();
    let key = HourKey::new(DeviceId::new("look-1"), at(10, 0));
    let wrong = HourRollup::Move(MoveHourRollup::empty(DeviceId::new("look-1"), at(10, 0), 60));
    h.store.compare_and_swap(&key, None, wrong).await.unwrap();

    let digest = look_digest(at(10, 0), at(11, 0), vec![person(1, at(10, 5), None)]);
    let report = h.engine.ingest(&digest).await.unwrap();
    assert!(matches!(report.structural[0], IngestError::DeviceTypeMismatch { .. }));
}

#[tokio::test]
async fn test_finalize_respects_grace_period() {
    let h = harness();
    let digest = look_digest(at(9, 0), at(11, 0), vec![person(1, at(9, 5), None), person(2, at(10, 5), None)]);
    h.engine.ingest(&digest).await.unwrap();

    // 10:14 is inside the grace period of hour 09
    assert!(h.engine.finalize_elapsed(at(10, 14)).await.unwrap().is_empty());

    let sealed = h.engine.finalize_elapsed(at(10, 15)).await.unwrap();
    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].key().hour_start, at(9, 0));
    assert!(look(&h.store, at(9, 0)).await.finalized);
    assert!(!look(&h.store, at(10, 0)).await.finalized);

    // Already sealed hours are not returned twice
    assert!(h.engine.finalize_elapsed(at(10, 20)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_late_events_for_sealed_hour_rejected() {
    let h = harness();
    h.engine
        .ingest(&look_digest(at(9, 0), at(10, 0), vec![person(1, at(9, 5), Some(at(9, 30)))]))
        .await
        .unwrap();
    h.engine.finalize_elapsed(at(12, 0)).await.unwrap();
    let before = look(&h.store, at(9, 0)).await;

    let late = look_digest(at(9, 0), at(10, 0), vec![person(9, at(9, 40), Some(at(9, 50)))]);
    let report = h.engine.ingest(&late).await.unwrap();

    assert_eq!(report.count(DiagnosticKind::SealedHour), 1);
    assert_eq!(look(&h.store, at(9, 0)).await, before);
}

#[tokio::test]
async fn test_diagnostics_carried_to_report() {
    let h = harness();
    let digest = move_digest(
        at(10, 0),
        at(10, 30),
        vec![door(1, BorderDirection::LeftToRight, at(10, 5)), door(2, BorderDirection::LeftToRight, at(10, 45))],
    );
    let report = h.engine.ingest(&digest).await.unwrap();
    assert_eq!(report.count(DiagnosticKind::OutOfBounds), 1);
    assert_eq!(report.written.len(), 1);
}

#[test]
fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
        max_attempts: 10,
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(100),
    };
    assert_eq!(policy.backoff(1), Duration::from_millis(20));
    assert_eq!(policy.backoff(2), Duration::from_millis(40));
    assert_eq!(policy.backoff(3), Duration::from_millis(80));
    assert_eq!(policy.backoff(4), Duration::from_millis(100));
    assert_eq!(policy.backoff(40), Duration::from_millis(100));
}
