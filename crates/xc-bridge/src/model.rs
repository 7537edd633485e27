//! Bridge data model
//!
//! Entities discovered from the bridge (devices, rooms, scenes) and the
//! state update types delivered to observers. Fields mirror the wire keys;
//! the bridge sends numbers and numeric strings interchangeably in sensor
//! values, so conversions go through [`value_as_f64`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque sensor/info entry attached to a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfoEntry {
    /// Numeric text code identifying the reading (e.g. "1222").
    #[serde(default)]
    pub text: String,

    /// Reading value; number or numeric string depending on firmware.
    #[serde(default)]
    pub value: Value,
}

/// A device as discovered from the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    /// Device kind tag.
    #[serde(default)]
    pub dev_type: i64,

    #[serde(default)]
    pub dimmable: bool,

    #[serde(default)]
    pub info: Vec<InfoEntry>,
}

/// Aggregate state of a room, as last seen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimmvalue: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lights_on: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loads_on: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows_open: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doors_open: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shades_closed: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_state: Option<i64>,
}

/// A room as discovered from the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,

    #[serde(default)]
    pub name: String,

    /// Member device ids. Only ids are stored; devices are looked up on
    /// demand to keep the entity graph acyclic.
    #[serde(default)]
    pub devices: Vec<String>,

    #[serde(flatten)]
    pub state: RoomState,
}

/// One device/value pair inside a scene definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneEntry {
    pub device_id: String,

    #[serde(default)]
    pub value: Value,
}

/// A scene as discovered from the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub scene_id: i64,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub devices: Vec<SceneEntry>,
}

/// Sensor readings decoded from a device's info entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetadata {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

impl DeviceMetadata {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none()
    }
}

/// State change for one device. Absent fields mean "unchanged".
#[derive(Debug, Clone, Default)]
pub struct DeviceStateUpdate {
    pub device_id: String,
    pub switch: Option<bool>,
    pub dimmvalue: Option<i64>,
    pub power: Option<f64>,
    pub curstate: Option<i64>,
    pub metadata: Option<DeviceMetadata>,
}

/// State change for one room; always carries the full aggregate.
#[derive(Debug, Clone, Default)]
pub struct RoomStateUpdate {
    pub room_id: String,
    pub state: RoomState,
}

/// Interpret a JSON value as a float, accepting numeric strings.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decode the recognized sensor text codes from a device info list.
///
/// Codes: 1222 temperature, 1223 humidity, 1109 temperature reported by a
/// dimming actuator. Everything else is silently ignored.
pub fn parse_info_metadata(entries: &[InfoEntry]) -> Option<DeviceMetadata> {
    let mut metadata = DeviceMetadata::default();

    for entry in entries {
        match entry.text.as_str() {
            "1222" | "1109" => metadata.temperature = value_as_f64(&entry.value),
            "1223" => metadata.humidity = value_as_f64(&entry.value),
            _ => {}
        }
    }

    if metadata.is_empty() {
        None
    } else {
        Some(metadata)
    }
}
