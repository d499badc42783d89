//! Facility registry - which devices and triggers an operator has registered

use crate::domain::types::{DeviceId, DeviceType, TriggerId, TriggerType};
use crate::infra::config::Config;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

/// Registered shape of one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub facility_id: String,
    pub device_type: DeviceType,
    pub borders: FxHashSet<TriggerId>,
    pub hotspots: FxHashSet<TriggerId>,
}

#[derive(Debug, Clone, Default)]
pub struct FacilityRegistry {
    devices: FxHashMap<DeviceId, DeviceEntry>,
    /// Devices per facility in configuration order
    facilities: FxHashMap<String, Vec<DeviceId>>,
}

impl FacilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (facility_id, device_id, device_type, borders, hotspots) in config.registered_devices() {
            registry.register(facility_id, device_id, device_type, borders, hotspots);
        }
        registry
    }

    /// Register a device; a device id may belong to one facility only
    pub fn register(
        &mut self,
        facility_id: &str,
        device_id: DeviceId,
        device_type: DeviceType,
        borders: impl IntoIterator<Item = TriggerId>,
        hotspots: impl IntoIterator<Item = TriggerId>,
    ) {
        if let Some(existing) = self.devices.get(&device_id) {
            warn!(
                device_id = %device_id,
                facility = %existing.facility_id,
                ignored_facility = %facility_id,
                "device_registered_twice"
            );
            return;
        }
        self.facilities.entry(facility_id.to_string()).or_default().push(device_id.clone());
        self.devices.insert(
            device_id,
            DeviceEntry {
                facility_id: facility_id.to_string(),
                device_type,
                borders: borders.into_iter().collect(),
                hotspots: hotspots.into_iter().collect(),
            },
        );
    }

    pub fn device(&self, device_id: &DeviceId) -> Option<&DeviceEntry> {
        self.devices.get(device_id)
    }

    pub fn device_type(&self, device_id: &DeviceId) -> Option<DeviceType> {
        self.devices.get(device_id).map(|d| d.device_type)
    }

    /// False for unknown devices and for triggers missing from a known device
    pub fn is_trigger_registered(
        &self,
        device_id: &DeviceId,
        trigger_type: TriggerType,
        trigger_id: &TriggerId,
    ) -> bool {
        self.devices.get(device_id).is_some_and(|d| match trigger_type {
            TriggerType::Border => d.borders.contains(trigger_id),
            TriggerType::Hotspot => d.hotspots.contains(trigger_id),
        })
    }

    pub fn facility_devices(&self, facility_id: &str) -> &[DeviceId] {
        self.facilities.get(facility_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Facility ids, sorted
    pub fn facility_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.facilities.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FacilityRegistry {
        let mut registry = FacilityRegistry::new();
        registry.register("mall", DeviceId::new("look-1"), DeviceType::Look, [], []);
        registry.register(
            "mall",
            DeviceId::new("move-1"),
            DeviceType::Move,
            [TriggerId::new("door")],
            [TriggerId::new("till")],
        );
        registry
    }

    #[test]
    fn test_trigger_registration() {
        let registry = registry();
        let move_1 = DeviceId::new("move-1");
        assert!(registry.is_trigger_registered(&move_1, TriggerType::Border, &TriggerId::new("door")));
        assert!(!registry.is_trigger_registered(&move_1, TriggerType::Hotspot, &TriggerId::new("door")));
        assert!(!registry.is_trigger_registered(
            &DeviceId::new("ghost"),
            TriggerType::Border,
            &TriggerId::new("door")
        ));
    }

    #[test]
    fn test_facility_devices_in_config_order() {
        let registry = registry();
        assert_eq!(
            registry.facility_devices("mall"),
            &[DeviceId::new("look-1"), DeviceId::new("move-1")]
        );
        assert!(registry.facility_devices("depot").is_empty());
        assert_eq!(registry.facility_ids(), vec!["mall"]);
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let mut registry = registry();
        registry.register("depot", DeviceId::new("look-1"), DeviceType::Move, [], []);
        assert_eq!(registry.device_type(&DeviceId::new("look-1")), Some(DeviceType::Look));
        assert!(registry.facility_devices("depot").is_empty());
    }
}
