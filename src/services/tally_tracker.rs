//! Sliding-window tally tracker
//!
//! Keeps a bounded, time-sorted list of recent raw events per device and
//! recounts distinct person/object keys over three windows on every write:
//! `[now - short, now]`, `[now - long, now]` and `[midnight UTC, now]`.
//! This runs independently of the hour rollups.

use crate::domain::tally::{DeviceTally, TallyEntry, TallyKey, TriggerRef, TriggerTally};
use crate::domain::types::{day_start, DeviceId, SensorEvent, TriggerType};
use crate::services::normalizer::NormalizedDigest;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Window widths and the retention horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TallyWindows {
    pub short: TimeDelta,
    pub long: TimeDelta,
    pub retention: TimeDelta,
}

impl TallyWindows {
    pub fn from_secs(short_secs: i64, long_secs: i64, retention_secs: i64) -> Self {
        let short = TimeDelta::seconds(short_secs.max(0));
        let long = TimeDelta::seconds(long_secs.max(0));
        // Retention must cover every window, including a full day
        let retention = TimeDelta::seconds(retention_secs.max(0)).max(long).max(TimeDelta::days(1));
        Self { short, long, retention }
    }
}

impl Default for TallyWindows {
    fn default() -> Self {
        Self::from_secs(15 * 60, 60 * 60, 24 * 60 * 60)
    }
}

/// The tally key and trigger an event is recorded under
pub fn tally_entry(event: &SensorEvent) -> TallyEntry {
    match event {
        SensorEvent::Person(p) => TallyEntry {
            time: p.enter_time,
            trigger: None,
            key: TallyKey::Person(p.key().to_string()),
        },
        SensorEvent::Border(b) => TallyEntry {
            time: b.time,
            trigger: Some(TriggerRef { trigger_type: TriggerType::Border, trigger_id: b.border_id.clone() }),
            key: TallyKey::Object(b.object_id.0),
        },
        SensorEvent::Hotspot(h) => TallyEntry {
            time: h.time,
            trigger: Some(TriggerRef { trigger_type: TriggerType::Hotspot, trigger_id: h.hotspot_id.clone() }),
            key: TallyKey::Object(h.object_id.0),
        },
        SensorEvent::Dwell(d) => TallyEntry { time: d.time, trigger: None, key: TallyKey::Object(d.object_id.0) },
    }
}

pub struct TallyTracker {
    devices: Mutex<FxHashMap<DeviceId, DeviceTally>>,
    windows: TallyWindows,
}

impl TallyTracker {
    pub fn new(windows: TallyWindows) -> Self {
        Self { devices: Mutex::new(FxHashMap::default()), windows }
    }

    /// Record one event and refresh the device's tallies as of `now`
    pub fn record_event(&self, device_id: &DeviceId, event: &SensorEvent, now: DateTime<Utc>) {
        let mut devices = self.devices.lock();
        let tally = devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceTally::new(device_id.clone()));
        let out_of_order = append_entry(&mut tally.entries, tally_entry(event), now - self.windows.retention);
        settle_entries(&mut tally.entries, out_of_order);
        refresh_tally(tally, &self.windows, now);
    }

    /// Record every accepted event of a normalized digest, refreshing once
    pub fn record_normalized(&self, digest: &NormalizedDigest, now: DateTime<Utc>) {
        let mut devices = self.devices.lock();
        let tally = devices
            .entry(digest.device_id.clone())
            .or_insert_with(|| DeviceTally::new(digest.device_id.clone()));
        let horizon = now - self.windows.retention;
        let retained_before = tally.entries.len();
        let mut out_of_order = false;
        for event in digest.events() {
            out_of_order |= append_entry(&mut tally.entries, tally_entry(event), horizon);
        }
        settle_entries(&mut tally.entries, out_of_order);
        let recorded = tally.entries.len() - retained_before;
        refresh_tally(tally, &self.windows, now);
        debug!(
            device_id = %digest.device_id,
            recorded,
            retained = tally.entries.len(),
            tally_15m = tally.tally_15m,
            "tally_recorded"
        );
    }

    /// Re-evaluate every device as of `now`, evicting expired entries
    pub fn refresh(&self, now: DateTime<Utc>) {
        let mut devices = self.devices.lock();
        for tally in devices.values_mut() {
            refresh_tally(tally, &self.windows, now);
        }
    }

    pub fn snapshot(&self, device_id: &DeviceId) -> Option<DeviceTally> {
        self.devices.lock().get(device_id).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}

/// Append an unexpired entry; returns true when it lands before the newest one.
///
/// In-order events, the common case, cost O(1). Late arrivals are appended
/// too and the whole batch is put back in order by one `settle_entries` call.
fn append_entry(entries: &mut VecDeque<TallyEntry>, entry: TallyEntry, horizon: DateTime<Utc>) -> bool {
    if entry.time < horizon {
        return false;
    }
    match entries.back() {
        Some(newest) if *newest == entry => false,
        Some(newest) if *newest > entry => {
            entries.push_back(entry);
            true
        }
        _ => {
            entries.push_back(entry);
            false
        }
    }
}

/// Restore (time, trigger, key) order and drop duplicates after late appends
fn settle_entries(entries: &mut VecDeque<TallyEntry>, out_of_order: bool) {
    if !out_of_order {
        return;
    }
    let mut sorted = Vec::from(std::mem::take(entries));
    // Sorted prefix plus a short late tail; the stable sort merges the runs
    sorted.sort();
    sorted.dedup();
    *entries = VecDeque::from(sorted);
}

fn refresh_tally(tally: &mut DeviceTally, windows: &TallyWindows, now: DateTime<Utc>) {
    let horizon = now - windows.retention;
    while tally.entries.front().is_some_and(|e| e.time < horizon) {
        tally.entries.pop_front();
    }

    let short_from = now - windows.short;
    let long_from = now - windows.long;
    let today_from = day_start(now);

    let mut device = [FxHashSet::default(), FxHashSet::default(), FxHashSet::default()];
    let mut triggers: BTreeMap<&TriggerRef, [FxHashSet<&TallyKey>; 3]> = BTreeMap::new();

    for entry in tally.entries.iter().filter(|e| e.time <= now) {
        let in_windows = [entry.time >= short_from, entry.time >= long_from, entry.time >= today_from];
        let trigger_sets = entry.trigger.as_ref().map(|t| triggers.entry(t).or_default());
        // Triggers seen only in retained history still report zero counts
        if let Some(sets) = trigger_sets {
            for (set, inside) in sets.iter_mut().zip(in_windows) {
                if inside {
                    set.insert(&entry.key);
                }
            }
        }
        for (set, inside) in device.iter_mut().zip(in_windows) {
            if inside {
                set.insert(&entry.key);
            }
        }
    }

    let [short, long, today] = device;
    let trigger_tallies: Vec<TriggerTally> = triggers
        .into_iter()
        .map(|(trigger, [short, long, today])| TriggerTally {
            trigger_type: trigger.trigger_type,
            trigger_id: trigger.trigger_id.clone(),
            tally_15m: short.len() as u32,
            tally_60m: long.len() as u32,
            tally_today: today.len() as u32,
        })
        .collect();

    tally.tally_15m = short.len() as u32;
    tally.tally_60m = long.len() as u32;
    tally.tally_today = today.len() as u32;
    tally.triggers = trigger_tallies;
    tally.refreshed_at = Some(now);
}
