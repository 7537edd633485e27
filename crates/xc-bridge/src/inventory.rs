//! Discovery inventory
//!
//! Devices, rooms and scenes reported by `SetAllData` (300) and
//! `SetHomeData` (303) payloads, keyed by their primary ids. Entries are
//! replaced wholesale on re-discovery; nothing is ever removed short of
//! tearing down the whole client. A `lastItem` marker on a payload means
//! the initial discovery is complete.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{Device, Room, Scene};

/// Id-keyed maps of everything the bridge has advertised.
#[derive(Debug, Default)]
pub struct Inventory {
    devices: HashMap<String, Device>,
    rooms: HashMap<String, Room>,
    scenes: HashMap<i64, Scene>,
    discovery_complete: bool,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a discovery payload. Returns `true` when this payload carried
    /// the `lastItem` marker.
    pub fn apply(&mut self, payload: &Value) -> bool {
        if let Some(items) = payload.get("devices").and_then(Value::as_array) {
            for item in items {
                match serde_json::from_value::<Device>(item.clone()) {
                    Ok(device) => {
                        self.devices.insert(device.device_id.clone(), device);
                    }
                    Err(e) => warn!("Discarding malformed device entry: {}", e),
                }
            }
        }

        if let Some(items) = payload.get("rooms").and_then(Value::as_array) {
            for item in items {
                match serde_json::from_value::<Room>(item.clone()) {
                    Ok(room) => {
                        self.rooms.insert(room.room_id.clone(), room);
                    }
                    Err(e) => warn!("Discarding malformed room entry: {}", e),
                }
            }
        }

        if let Some(items) = payload.get("scenes").and_then(Value::as_array) {
            for item in items {
                match serde_json::from_value::<Scene>(item.clone()) {
                    Ok(scene) => {
                        self.scenes.insert(scene.scene_id, scene);
                    }
                    Err(e) => warn!("Discarding malformed scene entry: {}", e),
                }
            }
        }

        let last_item = payload
            .get("lastItem")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if last_item && !self.discovery_complete {
            self.discovery_complete = true;
            debug!(
                devices = self.devices.len(),
                rooms = self.rooms.len(),
                scenes = self.scenes.len(),
                "Discovery complete"
            );
        }

        last_item
    }

    pub fn discovery_complete(&self) -> bool {
        self.discovery_complete
    }

    /// Reset the discovery marker for a fresh session; entities are kept so
    /// accessors keep answering while the bridge re-announces them.
    pub fn reset_discovery(&mut self) {
        self.discovery_complete = false;
    }

    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.rooms.values().cloned().collect()
    }

    pub fn scenes(&self) -> Vec<Scene> {
        self.scenes.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_merges_by_id() {
        let mut inventory = Inventory::new();

        let last = inventory.apply(&json!({
            "devices": [
                {"deviceId": "D1", "name": "Lamp", "devType": 101, "dimmable": true},
                {"deviceId": "D2", "name": "Plug", "devType": 100}
            ],
            "rooms": [{"roomId": "R1", "name": "Kitchen", "devices": ["D1"]}],
            "scenes": [{"sceneId": 1, "name": "Evening"}]
        }));

        assert!(!last);
        assert_eq!(inventory.devices().len(), 2);
        assert_eq!(inventory.rooms().len(), 1);
        assert_eq!(inventory.scenes().len(), 1);
        assert!(!inventory.discovery_complete());
    }

    #[test]
    fn test_rediscovery_replaces_in_place() {
        let mut inventory = Inventory::new();
        inventory.apply(&json!({
            "devices": [{"deviceId": "D1", "name": "Lamp", "devType": 101}]
        }));
        inventory.apply(&json!({
            "devices": [{"deviceId": "D1", "name": "Desk lamp", "devType": 101, "dimmable": true}]
        }));

        assert_eq!(inventory.devices().len(), 1);
        let device = inventory.device("D1").unwrap();
        assert_eq!(device.name, "Desk lamp");
        assert!(device.dimmable);
    }

    #[test]
    fn test_last_item_marks_discovery_complete() {
        let mut inventory = Inventory::new();
        assert!(inventory.apply(&json!({"devices": [], "lastItem": true})));
        assert!(inventory.discovery_complete());

        inventory.reset_discovery();
        assert!(!inventory.discovery_complete());
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let mut inventory = Inventory::new();
        inventory.apply(&json!({
            "devices": [{"name": "no id"}, {"deviceId": "D1", "name": "ok", "devType": 1}]
        }));
        assert_eq!(inventory.devices().len(), 1);
    }
}
