//! xComfort Bridge Client
//!
//! Long-lived client for the xComfort home-automation bridge and its custom
//! WebSocket protocol:
//! - Multi-step handshake (connection confirm, RSA key exchange, double-SHA
//!   login, token renewal)
//! - AES-256-CBC frame codec with the bridge's null-byte padding
//! - Acknowledgement discipline with timeouts and retries
//! - Inventory discovery (devices, rooms, scenes) and real-time state
//!   fan-out to registered observers
//! - Reconnect handling that preserves observer subscriptions

pub mod ack;
pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fanout;
pub mod inventory;
pub mod model;
pub mod protocol;
pub mod router;
pub mod transport;

pub use client::{BridgeClient, ListenerHandle, RoomAction};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use model::{Device, DeviceMetadata, DeviceStateUpdate, Room, RoomState, RoomStateUpdate, Scene};
