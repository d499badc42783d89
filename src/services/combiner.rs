//! Facility rollup combiner
//!
//! Assembles the device rollups of one facility for one hour into a
//! `FacilityHourReport`. Devices without a stored rollup contribute a zeroed
//! rollup of their registered type.
//!
//! Totals:
//! - entrances/exits: Look rollups plus border triggers (internal borders
//!   only ever count crossings, so they add nothing here)
//! - cumulative: same sources as entrances/exits
//! - occupancy_max: peak of the bucket-wise sum over the same sources
//! - hotspots and dwell-ping presence stay per device

use crate::domain::error::StoreError;
use crate::domain::rollup::{
    FacilityHourReport, FacilityTotals, HourKey, HourRollup, LookHourRollup, MoveHourRollup,
};
use crate::domain::types::{hour_start, DeviceId, DeviceType, TriggerType};
use crate::infra::registry::FacilityRegistry;
use crate::io::store::RollupStore;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FacilityCombiner {
    store: Arc<dyn RollupStore>,
    registry: Arc<FacilityRegistry>,
    bucket_count: usize,
}

impl FacilityCombiner {
    pub fn new(store: Arc<dyn RollupStore>, registry: Arc<FacilityRegistry>, bucket_count: usize) -> Self {
        Self { store, registry, bucket_count }
    }

    /// Combine every device registered to `facility_id`
    pub async fn combine_facility(
        &self,
        facility_id: &str,
        hour: DateTime<Utc>,
    ) -> Result<FacilityHourReport, StoreError> {
        let devices = self.registry.facility_devices(facility_id).to_vec();
        self.combine(facility_id, hour, &devices).await
    }

    pub async fn combine(
        &self,
        facility_id: &str,
        hour: DateTime<Utc>,
        device_ids: &[DeviceId],
    ) -> Result<FacilityHourReport, StoreError> {
        let hour = hour_start(hour);
        let mut look = Vec::new();
        let mut moves = Vec::new();
        let mut unknown_devices = Vec::new();
        let mut seen: FxHashSet<&DeviceId> = FxHashSet::default();

        for device_id in device_ids {
            if !seen.insert(device_id) {
                continue;
            }
            match self.store.load(&HourKey::new(device_id.clone(), hour)).await? {
                Some(stored) => match stored.value {
                    HourRollup::Look(r) => look.push(r),
                    HourRollup::Move(r) => moves.push(r),
                },
                None => match self.registry.device_type(device_id) {
                    Some(DeviceType::Look) => {
                        look.push(LookHourRollup::empty(device_id.clone(), hour, self.bucket_count))
                    }
                    Some(DeviceType::Move) => moves.push(self.zeroed_move(device_id, hour)),
                    None => {
                        warn!(facility = %facility_id, device_id = %device_id, "facility_device_unknown");
                        unknown_devices.push(device_id.clone());
                    }
                },
            }
        }

        look.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        moves.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        let totals = self.totals(&look, &moves);

        debug!(
            facility = %facility_id,
            hour_start = %hour,
            look = look.len(),
            moves = moves.len(),
            entrances = totals.entrances,
            exits = totals.exits,
            "facility_combined"
        );

        Ok(FacilityHourReport {
            facility_id: facility_id.to_string(),
            hour_start: hour,
            look,
            moves,
            totals,
            unknown_devices,
        })
    }

    /// Empty Move rollup listing the device's registered triggers
    fn zeroed_move(&self, device_id: &DeviceId, hour: DateTime<Utc>) -> MoveHourRollup {
        let mut rollup = MoveHourRollup::empty(device_id.clone(), hour, self.bucket_count);
        if let Some(entry) = self.registry.device(device_id) {
            for border in &entry.borders {
                rollup.trigger_mut(TriggerType::Border, border, self.bucket_count);
            }
            for hotspot in &entry.hotspots {
                rollup.trigger_mut(TriggerType::Hotspot, hotspot, self.bucket_count);
            }
        }
        rollup
    }

    fn totals(&self, look: &[LookHourRollup], moves: &[MoveHourRollup]) -> FacilityTotals {
        let mut totals = FacilityTotals::default();
        let mut occupancy = vec![0u32; self.bucket_count];

        for r in look {
            totals.entrances += r.entrances;
            totals.exits += r.exits;
            totals.cumulative += r.cumulative;
            totals.demographics.merge(&r.demographics);
            add_buckets(&mut occupancy, &r.sample_buckets, &r.device_id);
        }

        for r in moves {
            for t in r.triggers.iter().filter(|t| t.trigger_type == TriggerType::Border) {
                totals.entrances += t.counters.entrances;
                totals.exits += t.counters.exits;
                totals.cumulative += t.counters.cumulative;
                totals.internal_crossings += t.counters.internal_crossings;
                add_buckets(&mut occupancy, &t.counters.sample_buckets, &r.device_id);
            }
        }

        totals.delta = i64::from(totals.entrances) - i64::from(totals.exits);
        totals.occupancy_max = occupancy.into_iter().max().unwrap_or(0);
        totals
    }
}

fn add_buckets(sum: &mut [u32], buckets: &[u32], device_id: &DeviceId) {
    if buckets.len() != sum.len() {
        warn!(
            device_id = %device_id,
            buckets = buckets.len(),
            expected = sum.len(),
            "occupancy_buckets_skipped"
        );
        return;
    }
    for (total, count) in sum.iter_mut().zip(buckets) {
        *total += count;
    }
}
