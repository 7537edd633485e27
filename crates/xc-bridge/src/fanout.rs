//! State update fan-out
//!
//! Observers register per device or room id. A `StateUpdate` (310) payload
//! carries an `item` array; device items are coalesced by id before
//! dispatch (a device may appear once with switch/dim fields and again with
//! an info array in the same update), room items pass through one-to-one.
//! Callback panics are caught and logged so one misbehaving observer cannot
//! take the session down.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::model::{
    parse_info_metadata, value_as_f64, DeviceStateUpdate, InfoEntry, RoomState, RoomStateUpdate,
};

/// Observer for device state changes.
pub type DeviceCallback = Arc<dyn Fn(&DeviceStateUpdate) + Send + Sync>;

/// Observer for room state changes.
pub type RoomCallback = Arc<dyn Fn(&RoomStateUpdate) + Send + Sync>;

/// Registered observers, keyed by entity id.
///
/// Tokens identify individual registrations so they can be removed without
/// disturbing other observers of the same entity.
#[derive(Default)]
pub struct Listeners {
    devices: HashMap<String, Vec<(u64, DeviceCallback)>>,
    rooms: HashMap<String, Vec<(u64, RoomCallback)>>,
    next_token: u64,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device_listener(&mut self, device_id: &str, callback: DeviceCallback) -> u64 {
        let token = self.next_token();
        self.devices
            .entry(device_id.to_owned())
            .or_default()
            .push((token, callback));
        token
    }

    pub fn add_room_listener(&mut self, room_id: &str, callback: RoomCallback) -> u64 {
        let token = self.next_token();
        self.rooms
            .entry(room_id.to_owned())
            .or_default()
            .push((token, callback));
        token
    }

    /// Remove one registration; empty per-entity lists are dropped.
    pub fn remove(&mut self, token: u64) {
        self.devices.retain(|_, list| {
            list.retain(|(t, _)| *t != token);
            !list.is_empty()
        });
        self.rooms.retain(|_, list| {
            list.retain(|(t, _)| *t != token);
            !list.is_empty()
        });
    }

    /// Snapshot the callbacks for one device so dispatch can run without
    /// holding the registry lock.
    pub fn device_callbacks(&self, device_id: &str) -> Vec<DeviceCallback> {
        self.devices
            .get(device_id)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    pub fn room_callbacks(&self, room_id: &str) -> Vec<RoomCallback> {
        self.rooms
            .get(room_id)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

/// Updates extracted from one `StateUpdate` payload, in payload order.
#[derive(Debug, Default)]
pub struct CoalescedUpdate {
    pub devices: Vec<DeviceStateUpdate>,
    pub rooms: Vec<RoomStateUpdate>,
}

/// Split and coalesce a `StateUpdate` item array.
///
/// Device items merge by id into a single update; room items are taken
/// as-is. Items without a `deviceId` or `roomId` are ignored.
pub fn coalesce_items(items: &[Value]) -> CoalescedUpdate {
    let mut update = CoalescedUpdate::default();
    let mut device_order: Vec<String> = Vec::new();
    let mut device_updates: HashMap<String, DeviceStateUpdate> = HashMap::new();

    for item in items {
        if let Some(device_id) = item.get("deviceId").and_then(Value::as_str) {
            let Some(contribution) = device_contribution(item) else {
                continue;
            };
            let merged = device_updates
                .entry(device_id.to_owned())
                .or_insert_with(|| {
                    device_order.push(device_id.to_owned());
                    DeviceStateUpdate {
                        device_id: device_id.to_owned(),
                        ..Default::default()
                    }
                });
            merge_device_item(merged, item, contribution);
        } else if let Some(room_id) = item.get("roomId").and_then(Value::as_str) {
            let state: RoomState = serde_json::from_value(item.clone()).unwrap_or_default();
            update.rooms.push(RoomStateUpdate {
                room_id: room_id.to_owned(),
                state,
            });
        } else {
            debug!("State item without deviceId or roomId ignored");
        }
    }

    for device_id in device_order {
        if let Some(merged) = device_updates.remove(&device_id) {
            update.devices.push(merged);
        }
    }

    update
}

/// What a state item carries for a device: switch/dim fields, decoded
/// metadata, or nothing worth dispatching.
enum Contribution {
    SwitchOrDim,
    Metadata(crate::model::DeviceMetadata),
}

fn device_contribution(item: &Value) -> Option<Contribution> {
    if item.get("switch").is_some() || item.get("dimmvalue").is_some() {
        return Some(Contribution::SwitchOrDim);
    }

    let info = item.get("info").and_then(Value::as_array)?;
    let entries: Vec<InfoEntry> = info
        .iter()
        .filter_map(|e| serde_json::from_value(e.clone()).ok())
        .collect();
    parse_info_metadata(&entries).map(Contribution::Metadata)
}

fn merge_device_item(merged: &mut DeviceStateUpdate, item: &Value, contribution: Contribution) {
    match contribution {
        Contribution::SwitchOrDim => {
            if let Some(switch) = item.get("switch").and_then(Value::as_bool) {
                merged.switch = Some(switch);
            }
            if let Some(dim) = item.get("dimmvalue").and_then(Value::as_i64) {
                merged.dimmvalue = Some(dim);
            }
            if let Some(power) = item.get("power").and_then(value_as_f64) {
                merged.power = Some(power);
            }
            if let Some(curstate) = item.get("curstate").and_then(Value::as_i64) {
                merged.curstate = Some(curstate);
            }
        }
        Contribution::Metadata(metadata) => merged.metadata = Some(metadata),
    }
}

/// Deliver one coalesced update to the registered observers.
///
/// Callbacks run outside the registry lock (the callback lists are
/// pre-snapshotted) and panics are contained per callback.
pub fn dispatch(update: &CoalescedUpdate, listeners: &std::sync::Mutex<Listeners>) {
    for device_update in &update.devices {
        let callbacks = match listeners.lock() {
            Ok(guard) => guard.device_callbacks(&device_update.device_id),
            Err(poisoned) => poisoned.into_inner().device_callbacks(&device_update.device_id),
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(device_update))).is_err() {
                error!(
                    device_id = %device_update.device_id,
                    "Device state listener panicked"
                );
            }
        }
    }

    for room_update in &update.rooms {
        let callbacks = match listeners.lock() {
            Ok(guard) => guard.room_callbacks(&room_update.room_id),
            Err(poisoned) => poisoned.into_inner().room_callbacks(&room_update.room_id),
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(room_update))).is_err() {
                error!(room_id = %room_update.room_id, "Room state listener panicked");
            }
        }
    }

    if update.devices.is_empty() && update.rooms.is_empty() {
        debug!("State update contained no routable items");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_coalesce_merges_device_items() {
        let items = vec![
            json!({"deviceId": "D1", "switch": true, "dimmvalue": 80}),
            json!({"deviceId": "D1", "info": [{"text": "1109", "value": "22.5"}]}),
        ];

        let update = coalesce_items(&items);
        assert_eq!(update.devices.len(), 1);

        let merged = &update.devices[0];
        assert_eq!(merged.switch, Some(true));
        assert_eq!(merged.dimmvalue, Some(80));
        let metadata = merged.metadata.as_ref().unwrap();
        assert_eq!(metadata.temperature, Some(22.5));
    }

    #[test]
    fn test_coalesce_keeps_rooms_separate() {
        let items = vec![
            json!({"roomId": "R1", "switch": true, "lightsOn": 2}),
            json!({"roomId": "R1", "switch": false, "lightsOn": 0}),
        ];

        let update = coalesce_items(&items);
        assert_eq!(update.rooms.len(), 2);
        assert_eq!(update.rooms[0].state.switch, Some(true));
        assert_eq!(update.rooms[1].state.lights_on, Some(0));
    }

    #[test]
    fn test_coalesce_preserves_device_order() {
        let items = vec![
            json!({"deviceId": "D2", "switch": false}),
            json!({"deviceId": "D1", "switch": true}),
            json!({"deviceId": "D2", "info": [{"text": "1222", "value": 20}]}),
        ];

        let update = coalesce_items(&items);
        let ids: Vec<&str> = update.devices.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, vec!["D2", "D1"]);
        assert!(update.devices[0].metadata.is_some());
    }

    #[test]
    fn test_items_without_content_are_ignored() {
        let items = vec![
            json!({"switch": true}),
            json!({"deviceId": "D1", "unrelated": 1}),
            json!({"deviceId": "D2", "info": [{"text": "9999", "value": 1}]}),
        ];
        let update = coalesce_items(&items);
        assert!(update.devices.is_empty());
        assert!(update.rooms.is_empty());
    }

    #[test]
    fn test_power_and_curstate_copied_with_switch() {
        let items = vec![json!({
            "deviceId": "D1", "switch": true, "power": "12.5", "curstate": 3
        })];
        let update = coalesce_items(&items);
        assert_eq!(update.devices[0].power, Some(12.5));
        assert_eq!(update.devices[0].curstate, Some(3));
    }

    #[test]
    fn test_listener_tokens_remove_only_their_entry() {
        let mut listeners = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let t1 = listeners.add_device_listener("D1", Arc::new(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = Arc::clone(&count);
        let _t2 = listeners.add_device_listener("D1", Arc::new(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        }));

        listeners.remove(t1);
        let callbacks = listeners.device_callbacks("D1");
        assert_eq!(callbacks.len(), 1);

        let update = DeviceStateUpdate { device_id: "D1".into(), ..Default::default() };
        for cb in callbacks {
            cb(&update);
        }
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_dispatch_survives_panicking_listener() {
        let listeners = Mutex::new(Listeners::new());
        let reached = Arc::new(AtomicUsize::new(0));

        {
            let mut guard = listeners.lock().unwrap();
            guard.add_device_listener("D1", Arc::new(|_| panic!("observer bug")));
            let reached = Arc::clone(&reached);
            guard.add_device_listener("D1", Arc::new(move |_| {
                reached.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let update = CoalescedUpdate {
            devices: vec![DeviceStateUpdate { device_id: "D1".into(), ..Default::default() }],
            rooms: Vec::new(),
        };
        dispatch(&update, &listeners);

        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }
}
