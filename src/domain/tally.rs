//! Live sliding-window tallies per device and trigger

use crate::domain::types::{DeviceId, TriggerId, TriggerType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Who a retained tally entry counts
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TallyKey {
    Person(String),
    Object(i64),
}

/// Trigger an entry was recorded against
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TriggerRef {
    pub trigger_type: TriggerType,
    pub trigger_id: TriggerId,
}

/// One retained raw event
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TallyEntry {
    pub time: DateTime<Utc>,
    pub trigger: Option<TriggerRef>,
    pub key: TallyKey,
}

/// Distinct-key counts for one trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerTally {
    pub trigger_type: TriggerType,
    pub trigger_id: TriggerId,
    pub tally_15m: u32,
    pub tally_60m: u32,
    pub tally_today: u32,
}

/// Rolling counts for one device, refreshed on every recorded event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceTally {
    pub device_id: DeviceId,
    /// Sorted by time, oldest first
    #[serde(skip)]
    pub entries: VecDeque<TallyEntry>,
    pub tally_15m: u32,
    pub tally_60m: u32,
    pub tally_today: u32,
    /// Sorted by (trigger_type, trigger_id)
    pub triggers: Vec<TriggerTally>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl DeviceTally {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            entries: VecDeque::new(),
            tally_15m: 0,
            tally_60m: 0,
            tally_today: 0,
            triggers: Vec::new(),
            refreshed_at: None,
        }
    }

    pub fn trigger(&self, trigger_type: TriggerType, trigger_id: &TriggerId) -> Option<&TriggerTally> {
        self.triggers
            .iter()
            .find(|t| t.trigger_type == trigger_type && &t.trigger_id == trigger_id)
    }
}
