//! Bridge client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Client type advertised in the connection confirm message.
pub const CLIENT_TYPE: &str = "shl-app";

/// Client identifier advertised in the connection confirm message.
pub const CLIENT_ID: &str = "xc-bridge";

/// Client version advertised in the connection confirm message.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default WebSocket port on the bridge.
pub const DEFAULT_PORT: u16 = 80;

/// Connection parameters for a single bridge.
///
/// `host` and `auth_key` are consumed once at `init()` time; changing them
/// requires a re-init. The timing fields default to the protocol values and
/// only tests normally need to override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge IP address or host name.
    pub host: String,

    /// Authentication key printed on the bridge.
    pub auth_key: String,

    /// WebSocket port (the bridge firmware listens on plain port 80).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Window for the whole handshake plus initial discovery.
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Interval between periodic heartbeats once authenticated.
    #[serde(default = "default_heartbeat_interval", with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Delay before the single reconnect attempt after a session loss.
    #[serde(default = "default_reconnect_delay", with = "duration_secs")]
    pub reconnect_delay: Duration,

    /// How long to wait for the bridge to acknowledge a tracked message.
    #[serde(default = "default_ack_timeout", with = "duration_secs")]
    pub ack_timeout: Duration,

    /// Pause between send attempts of a tracked message.
    #[serde(default = "default_retry_delay", with = "duration_millis")]
    pub retry_delay: Duration,

    /// Total send attempts for a tracked message.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Length of the random login salt.
    #[serde(default = "default_salt_length")]
    pub salt_length: usize,
}

impl BridgeConfig {
    /// Create a config with protocol-default timings.
    pub fn new(host: impl Into<String>, auth_key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            auth_key: auth_key.into(),
            port: default_port(),
            connect_timeout: default_connect_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            reconnect_delay: default_reconnect_delay(),
            ack_timeout: default_ack_timeout(),
            retry_delay: default_retry_delay(),
            max_retries: default_max_retries(),
            salt_length: default_salt_length(),
        }
    }

    /// Check that the fields required at `init()` time are present.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() || self.auth_key.trim().is_empty() {
            return Err(BridgeError::ConfigMissing);
        }
        Ok(())
    }

    /// URL the transport connects to.
    pub fn ws_url(&self) -> String {
        if self.port == DEFAULT_PORT {
            format!("ws://{}", self.host)
        } else {
            format!("ws://{}:{}", self.host, self.port)
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_retries() -> u32 {
    3
}

fn default_salt_length() -> usize {
    32
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
