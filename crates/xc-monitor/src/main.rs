//! xComfort bridge monitor
//!
//! Connects to a bridge, subscribes to every discovered device and room and
//! logs state changes until interrupted. Configuration comes from the
//! environment (a `.env` file is honoured):
//!
//! - `XCOMFORT_BRIDGE_IP`  - bridge address (required)
//! - `XCOMFORT_AUTH_KEY`   - authentication key (required)
//! - `XCOMFORT_PORT`       - WebSocket port (optional, default 80)

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use xc_bridge::{BridgeClient, BridgeConfig};

#[derive(Debug, Deserialize)]
struct MonitorSettings {
    bridge_ip: String,
    auth_key: String,
    port: Option<u16>,
}

impl MonitorSettings {
    /// Layer the environment over an optional `.env` file.
    fn load() -> Result<Self> {
        if dotenvy::dotenv().is_ok() {
            info!("Loaded settings from .env");
        }

        config::Config::builder()
            .add_source(config::Environment::with_prefix("XCOMFORT").try_parsing(true))
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("XCOMFORT_BRIDGE_IP and XCOMFORT_AUTH_KEY must be set")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("==============================================");
    info!("   xComfort Bridge Monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("==============================================");

    let settings = MonitorSettings::load()?;
    let mut config = BridgeConfig::new(settings.bridge_ip, settings.auth_key);
    if let Some(port) = settings.port {
        config.port = port;
    }

    info!("Connecting to bridge at {}...", config.host);
    let client = BridgeClient::new(config);
    client.init().await.context("connecting to the bridge")?;

    let devices = client.get_devices();
    let rooms = client.get_rooms();
    let scenes = client.get_detailed_scenes();
    info!(
        "Connected: {} devices, {} rooms, {} scenes",
        devices.len(),
        rooms.len(),
        scenes.len()
    );

    let mut handles = Vec::new();
    for device in &devices {
        let name = device.name.clone();
        handles.push(client.add_device_state_listener(&device.device_id, move |update| {
            info!(
                device = %name,
                switch = ?update.switch,
                dim = ?update.dimmvalue,
                power = ?update.power,
                temperature = ?update.metadata.as_ref().and_then(|m| m.temperature),
                humidity = ?update.metadata.as_ref().and_then(|m| m.humidity),
                "Device update"
            );
        }));
    }
    for room in &rooms {
        let name = room.name.clone();
        handles.push(client.add_room_state_listener(&room.room_id, move |update| {
            info!(
                room = %name,
                switch = ?update.state.switch,
                lights_on = ?update.state.lights_on,
                power = ?update.state.power,
                "Room update"
            );
        }));
    }
    info!("Subscribed to {} entities, watching (Ctrl-C to stop)", handles.len());

    let mut connected = client.connected_watch();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = connected.changed() => {
                if changed.is_err() {
                    break;
                }
                if *connected.borrow() {
                    info!("Bridge connection restored");
                } else {
                    warn!("Bridge connection lost");
                }
            }
        }
    }

    info!("Shutting down");
    client.cleanup().await;
    Ok(())
}
