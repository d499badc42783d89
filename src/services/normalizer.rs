//! Event normalizer
//!
//! Validates one device digest and splits it into per-hour groups:
//! - crossings and pings belong to the hour of their timestamp
//! - a person detection is copied into every hour its session touches
//! - groups come out in chronological order so cumulative carry-forward
//!   can be applied hour by hour
//!
//! Problems with single events become diagnostics; the rest of the digest
//! is still processed. Normalizing is pure and may be repeated freely.

use crate::domain::error::{Diagnostic, DiagnosticKind};
use crate::domain::rollup::HourKey;
use crate::domain::types::{
    hour_start, DeviceDigest, DeviceId, DeviceType, PersonDetection, SensorEvent, TriggerId,
    TriggerType, HOUR,
};
use crate::infra::registry::FacilityRegistry;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Longest session a single detection may describe
pub const MAX_SESSION_SPAN: TimeDelta = TimeDelta::hours(24);

/// Validated events of one device for one hour
#[derive(Debug, Clone, PartialEq)]
pub struct HourGroup {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub hour_start: DateTime<Utc>,
    /// How far into this hour the digest has observed
    pub observed_until: DateTime<Utc>,
    /// Sorted by event time
    pub events: Vec<SensorEvent>,
    /// Triggers in `events` that are not in the registry
    pub unregistered_triggers: BTreeSet<(TriggerType, TriggerId)>,
}

impl HourGroup {
    /// A group with no events, used to re-derive an hour from its predecessor
    pub fn empty(device_id: DeviceId, device_type: DeviceType, hour_start: DateTime<Utc>) -> Self {
        Self {
            device_id,
            device_type,
            hour_start,
            observed_until: hour_start,
            events: Vec::new(),
            unregistered_triggers: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> HourKey {
        HourKey::new(self.device_id.clone(), self.hour_start)
    }

    #[inline]
    pub fn is_unregistered(&self, trigger_type: TriggerType, trigger_id: &TriggerId) -> bool {
        self.unregistered_triggers.contains(&(trigger_type, trigger_id.clone()))
    }
}

/// A digest split into chronologically ordered hour groups
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedDigest {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub collection_time: DateTime<Utc>,
    pub groups: Vec<HourGroup>,
    pub diagnostics: Vec<Diagnostic>,
    /// Events (not hour copies) that passed validation
    pub accepted: usize,
}

impl NormalizedDigest {
    pub fn rejected(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.kind.drops_event()).count()
    }

    pub fn unregistered(&self) -> usize {
        self.diagnostics.iter().filter(|d| !d.kind.drops_event()).count()
    }

    /// Every accepted event once, in time order (hour copies collapsed)
    pub fn events(&self) -> impl Iterator<Item = &SensorEvent> {
        self.groups.iter().flat_map(|group| {
            let hour = group.hour_start;
            // A person is copied into every hour it touches; yield only the first copy
            group.events.iter().filter(move |event| match event {
                SensorEvent::Person(p) => hour_start(p.enter_time) == hour,
                _ => true,
            })
        })
    }
}

pub struct Normalizer {
    registry: Arc<FacilityRegistry>,
}

impl Normalizer {
    pub fn new(registry: Arc<FacilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FacilityRegistry {
        &self.registry
    }

    pub fn normalize(&self, digest: &DeviceDigest) -> NormalizedDigest {
        let mut out = NormalizedDigest {
            device_id: digest.device_id.clone(),
            device_type: digest.device_type,
            collection_time: digest.collection_time,
            groups: Vec::new(),
            diagnostics: Vec::new(),
            accepted: 0,
        };

        if digest.time_min > digest.time_max {
            warn!(
                device_id = %digest.device_id,
                time_min = %digest.time_min,
                time_max = %digest.time_max,
                "digest_window_inverted"
            );
            out.diagnostics.push(Diagnostic::new(
                DiagnosticKind::InvalidDigestWindow,
                format!("timeMin {} after timeMax {}", digest.time_min, digest.time_max),
            ));
            return out;
        }

        let device_registered = match self.registry.device_type(&digest.device_id) {
            Some(registered) if registered != digest.device_type => {
                warn!(
                    device_id = %digest.device_id,
                    registered = registered.as_str(),
                    digest = digest.device_type.as_str(),
                    "digest_device_type_mismatch"
                );
                out.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::DeviceTypeMismatch,
                    format!(
                        "device {} registered as {}, digest says {}",
                        digest.device_id,
                        registered.as_str(),
                        digest.device_type.as_str()
                    ),
                ));
                return out;
            }
            Some(_) => true,
            None => {
                warn!(device_id = %digest.device_id, "unregistered_device");
                out.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::UnregisteredDevice,
                    format!("device {} is not registered to any facility", digest.device_id),
                ));
                false
            }
        };

        let mut by_hour: BTreeMap<DateTime<Utc>, Vec<SensorEvent>> = BTreeMap::new();
        let mut unregistered: BTreeSet<(TriggerType, TriggerId)> = BTreeSet::new();

        for person in &digest.person_detections {
            if digest.device_type != DeviceType::Look {
                self.mismatch(&mut out, digest, "person detection");
                continue;
            }
            match validate_person(person, digest) {
                Ok(span_end) => {
                    let mut hour = hour_start(person.enter_time);
                    // An open session observed up to an hour edge stops short of the next hour
                    let last = match person.exit_time {
                        Some(_) => hour_start(span_end),
                        None => hour_start(span_end - TimeDelta::nanoseconds(1)).max(hour),
                    };
                    while hour <= last {
                        by_hour.entry(hour).or_default().push(SensorEvent::Person(person.clone()));
                        hour += HOUR;
                    }
                    out.accepted += 1;
                }
                Err(diagnostic) => {
                    warn!(
                        device_id = %digest.device_id,
                        kind = diagnostic.kind.as_str(),
                        detail = %diagnostic.detail,
                        "person_rejected"
                    );
                    out.diagnostics.push(diagnostic);
                }
            }
        }

        let crossings = digest
            .border_crossings
            .iter()
            .map(|b| (Some((TriggerType::Border, &b.border_id)), SensorEvent::Border(b.clone())))
            .chain(digest.hotspot_crossings.iter().map(|h| {
                (Some((TriggerType::Hotspot, &h.hotspot_id)), SensorEvent::Hotspot(h.clone()))
            }))
            .chain(digest.dwell_pings.iter().map(|d| (None, SensorEvent::Dwell(d.clone()))));

        for (trigger, event) in crossings {
            if digest.device_type != DeviceType::Move {
                self.mismatch(&mut out, digest, event.as_str());
                continue;
            }
            let time = event.time();
            if time < digest.time_min || time > digest.time_max {
                warn!(
                    device_id = %digest.device_id,
                    event = event.as_str(),
                    time = %time,
                    "event_out_of_bounds"
                );
                out.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::OutOfBounds,
                    format!(
                        "{} at {} outside [{}, {}]",
                        event.as_str(),
                        time,
                        digest.time_min,
                        digest.time_max
                    ),
                ));
                continue;
            }
            if let Some((trigger_type, trigger_id)) = trigger {
                if !self.registry.is_trigger_registered(&digest.device_id, trigger_type, trigger_id)
                    && unregistered.insert((trigger_type, trigger_id.clone()))
                {
                    if device_registered {
                        warn!(
                            device_id = %digest.device_id,
                            trigger_type = trigger_type.as_str(),
                            trigger_id = %trigger_id,
                            "unregistered_trigger"
                        );
                    }
                    out.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::UnregisteredTrigger,
                        format!("{} {} on device {}", trigger_type.as_str(), trigger_id, digest.device_id),
                    ));
                }
            }
            by_hour.entry(hour_start(time)).or_default().push(event);
            out.accepted += 1;
        }

        out.groups = by_hour
            .into_iter()
            .map(|(hour, mut events)| {
                events.sort_by_key(SensorEvent::time);
                let unregistered_triggers = events
                    .iter()
                    .filter_map(|e| match e {
                        SensorEvent::Border(b) => Some((TriggerType::Border, b.border_id.clone())),
                        SensorEvent::Hotspot(h) => Some((TriggerType::Hotspot, h.hotspot_id.clone())),
                        _ => None,
                    })
                    .filter(|t| unregistered.contains(t))
                    .collect();
                HourGroup {
                    device_id: digest.device_id.clone(),
                    device_type: digest.device_type,
                    hour_start: hour,
                    observed_until: digest.time_max.clamp(hour, hour + HOUR),
                    events,
                    unregistered_triggers,
                }
            })
            .collect();

        debug!(
            device_id = %digest.device_id,
            groups = out.groups.len(),
            accepted = out.accepted,
            diagnostics = out.diagnostics.len(),
            "digest_normalized"
        );
        out
    }

    fn mismatch(&self, out: &mut NormalizedDigest, digest: &DeviceDigest, what: &str) {
        warn!(
            device_id = %digest.device_id,
            device_type = digest.device_type.as_str(),
            event = what,
            "event_device_type_mismatch"
        );
        out.diagnostics.push(Diagnostic::new(
            DiagnosticKind::DeviceTypeMismatch,
            format!("{} on {} device {}", what, digest.device_type.as_str(), digest.device_id),
        ));
    }
}

/// Check one detection; returns the end of its session span
fn validate_person(
    person: &PersonDetection,
    digest: &DeviceDigest,
) -> Result<DateTime<Utc>, Diagnostic> {
    let key = person.key();
    if person.session_id.is_empty() {
        return Err(Diagnostic::new(
            DiagnosticKind::InvalidSession,
            format!("person {} has an empty session id", person.person_id),
        ));
    }
    if person.exit_time.is_some_and(|exit| exit < person.enter_time) {
        return Err(Diagnostic::new(
            DiagnosticKind::InvalidSession,
            format!("person {} exits before entering", key),
        ));
    }
    if person
        .time_periods
        .iter()
        .any(|p| p.exit_time.is_some_and(|exit| exit < p.enter_time))
    {
        return Err(Diagnostic::new(
            DiagnosticKind::InvalidSession,
            format!("person {} has an inverted time period", key),
        ));
    }

    let span_end = person.exit_time.unwrap_or(digest.time_max).max(person.enter_time);
    if span_end - person.enter_time > MAX_SESSION_SPAN {
        return Err(Diagnostic::new(
            DiagnosticKind::InvalidSession,
            format!("person {} session spans more than {}h", key, MAX_SESSION_SPAN.num_hours()),
        ));
    }
    if person.enter_time > digest.time_max || span_end < digest.time_min {
        return Err(Diagnostic::new(
            DiagnosticKind::OutOfBounds,
            format!(
                "person {} session [{}, {}] outside [{}, {}]",
                key, person.enter_time, span_end, digest.time_min, digest.time_max
            ),
        ));
    }
    Ok(span_end)
}
