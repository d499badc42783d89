//! Shared types for the rollup engine
//!
//! Raw sensor observations as uploaded by the proxy agent, plus the small
//! time helpers every component uses to place an event in its hour.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One hour, the width of every rollup window
pub const HOUR: TimeDelta = TimeDelta::hours(1);

/// Newtype wrapper for device IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for trigger (border or hotspot) IDs
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(pub String);

impl TriggerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TriggerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for Move sensor object IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub i64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one person within a Look device.
///
/// `person_id` is only unique inside a sensor session, so the pair is the key.
/// Serialized as `"<session_id>/<person_id>"` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PersonKey {
    pub session_id: String,
    pub person_id: i64,
}

impl PersonKey {
    pub fn new(session_id: impl Into<String>, person_id: i64) -> Self {
        Self { session_id: session_id.into(), person_id }
    }
}

impl std::fmt::Display for PersonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session_id, self.person_id)
    }
}

impl From<PersonKey> for String {
    fn from(key: PersonKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PersonKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (session_id, person_id) =
            value.rsplit_once('/').ok_or_else(|| format!("person key without '/': {value}"))?;
        let person_id = person_id
            .parse::<i64>()
            .map_err(|e| format!("person key {value} has invalid person id: {e}"))?;
        Ok(Self { session_id: session_id.to_string(), person_id })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Look,
    Move,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Look => "look",
            DeviceType::Move => "move",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BorderDirection {
    LeftToRight,
    RightToLeft,
}

/// Meaning the sensor configuration attaches to a border
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interpretation {
    None,
    Entrance,
    Egress,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HotspotDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DwellKind {
    Detected,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    Border,
    Hotspot,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Border => "border",
            TriggerType::Hotspot => "hotspot",
        }
    }
}

/// A continuous stretch of presence inside a Look session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimePeriod {
    pub enter_time: DateTime<Utc>,
    /// None while the person is still in view
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonDetection {
    pub person_id: i64,
    pub session_id: String,
    pub enter_time: DateTime<Utc>,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clean_exit: bool,
    #[serde(default)]
    pub time_periods: SmallVec<[TimePeriod; 4]>,
    #[serde(default)]
    pub age: f32,
    #[serde(default)]
    pub age_confidence: f32,
    #[serde(default = "unknown_gender")]
    pub gender: Gender,
    #[serde(default)]
    pub gender_confidence: f32,
}

fn unknown_gender() -> Gender {
    Gender::Unknown
}

impl PersonDetection {
    #[inline]
    pub fn key(&self) -> PersonKey {
        PersonKey::new(self.session_id.clone(), self.person_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorderCrossing {
    pub border_id: TriggerId,
    pub direction: BorderDirection,
    #[serde(default = "no_interpretation")]
    pub interpretation: Interpretation,
    #[serde(default)]
    pub is_outer_border: bool,
    pub object_id: ObjectId,
    pub time: DateTime<Utc>,
}

fn no_interpretation() -> Interpretation {
    Interpretation::None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotspotCrossing {
    pub hotspot_id: TriggerId,
    pub direction_type: HotspotDirection,
    pub object_id: ObjectId,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DwellPing {
    pub object_id: ObjectId,
    pub kind: DwellKind,
    pub time: DateTime<Utc>,
}

/// One proxy upload for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDigest {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub collection_time: DateTime<Utc>,
    pub time_min: DateTime<Utc>,
    pub time_max: DateTime<Utc>,
    #[serde(default)]
    pub person_detections: Vec<PersonDetection>,
    #[serde(default)]
    pub border_crossings: Vec<BorderCrossing>,
    #[serde(default)]
    pub hotspot_crossings: Vec<HotspotCrossing>,
    #[serde(default)]
    pub dwell_pings: Vec<DwellPing>,
}

impl DeviceDigest {
    /// Earliest time this digest can touch: its window start or an earlier session start
    pub fn earliest_time(&self) -> DateTime<Utc> {
        self.person_detections
            .iter()
            .map(|p| p.enter_time)
            .fold(self.time_min, |earliest, t| earliest.min(t))
    }

    pub fn event_count(&self) -> usize {
        self.person_detections.len()
            + self.border_crossings.len()
            + self.hotspot_crossings.len()
            + self.dwell_pings.len()
    }
}

/// A single normalized sensor event
#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Person(PersonDetection),
    Border(BorderCrossing),
    Hotspot(HotspotCrossing),
    Dwell(DwellPing),
}

impl SensorEvent {
    /// Timestamp used for ordering inside an hour group
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            SensorEvent::Person(p) => p.enter_time,
            SensorEvent::Border(b) => b.time,
            SensorEvent::Hotspot(h) => h.time,
            SensorEvent::Dwell(d) => d.time,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorEvent::Person(_) => "person",
            SensorEvent::Border(_) => "border",
            SensorEvent::Hotspot(_) => "hotspot",
            SensorEvent::Dwell(_) => "dwell",
        }
    }
}

/// Truncate a timestamp to a multiple of `secs` since the epoch
#[inline]
fn truncate_to(t: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    t - TimeDelta::seconds(t.timestamp().rem_euclid(secs))
        - TimeDelta::nanoseconds(i64::from(t.timestamp_subsec_nanos()))
}

/// Start of the hour bucket that owns `t`
#[inline]
pub fn hour_start(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to(t, 3600)
}

/// UTC midnight of the day containing `t`
#[inline]
pub fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to(t, 86_400)
}

/// True when `t` falls in `[hour, hour + 1h)`
#[inline]
pub fn in_hour(t: DateTime<Utc>, hour: DateTime<Utc>) -> bool {
    t >= hour && t < hour + HOUR
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hour_start_truncates() {
        let t = Utc.with_ymd_and_hms(2025, 3, 14, 10, 47, 31).unwrap()
            + TimeDelta::milliseconds(250);
        assert_eq!(hour_start(t), Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap());
        assert_eq!(day_start(t), Utc.with_ymd_and_hms(2025, 3, 14, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_hour_boundary_belongs_to_next_hour() {
        let ten = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap();
        assert_eq!(hour_start(ten), ten);
        assert!(in_hour(ten, ten));
        assert!(!in_hour(ten + HOUR, ten));
    }

    #[test]
    fn test_person_key_string_form() {
        let key = PersonKey::new("sess/a", 42);
        let s: String = key.clone().into();
        assert_eq!(s, "sess/a/42");
        assert_eq!(PersonKey::try_from(s).unwrap(), key);
        assert!(PersonKey::try_from("nokey".to_string()).is_err());
    }

    #[test]
    fn test_digest_deserializes_camel_case() {
        let json = r#"{
            "deviceId": "look-1",
            "deviceType": "look",
            "collectionTime": "2025-03-14T11:00:00Z",
            "timeMin": "2025-03-14T10:00:00Z",
            "timeMax": "2025-03-14T11:00:00Z",
            "personDetections": [{
                "personId": 7,
                "sessionId": "s1",
                "enterTime": "2025-03-14T10:02:00Z",
                "exitTime": "2025-03-14T10:47:00Z",
                "cleanExit": true,
                "timePeriods": [{"enterTime": "2025-03-14T10:02:00Z", "exitTime": "2025-03-14T10:47:00Z"}],
                "age": 31.5,
                "ageConfidence": 0.9,
                "gender": "Female",
                "genderConfidence": 0.8
            }],
            "borderCrossings": [{
                "borderId": "b1",
                "direction": "LeftToRight",
                "isOuterBorder": true,
                "objectId": 3,
                "time": "2025-03-14T10:05:00Z"
            }]
        }"#;

        let mut digest: DeviceDigest = serde_json::from_str(json).unwrap();
        assert_eq!(digest.device_id, DeviceId::new("look-1"));
        assert_eq!(digest.person_detections[0].key(), PersonKey::new("s1", 7));
        assert_eq!(digest.person_detections[0].time_periods.len(), 1);
        assert_eq!(digest.border_crossings[0].interpretation, Interpretation::None);
        assert!(digest.hotspot_crossings.is_empty());
        assert_eq!(digest.event_count(), 2);
        assert_eq!(digest.earliest_time(), digest.time_min);

        digest.person_detections[0].enter_time = "2025-03-14T09:40:00Z".parse().unwrap();
        assert_eq!(digest.earliest_time(), digest.person_detections[0].enter_time);
    }
}
