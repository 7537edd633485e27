//! Bridge wire protocol
//!
//! Every frame carries a JSON envelope `{"type_int", "mc"?, "ref"?,
//! "info"?, "payload"?}`. Client-originated messages (except ACK) carry a
//! per-session monotonic counter `mc`; acknowledgements echo it back in
//! `ref`.

use serde_json::{json, Map, Value};

/// Message types observed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Nack = 0,
    Ack = 1,
    Heartbeat = 2,
    Ping = 3,
    ConnectionStart = 10,
    ConnectionConfirm = 11,
    ScInitResponse = 12,
    ConnectionDeclined = 13,
    ScInitRequest = 14,
    PublicKeyResponse = 15,
    SecretExchange = 16,
    SecretExchangeAck = 17,
    LoginRequest = 30,
    LoginResponse = 32,
    TokenApply = 33,
    TokenApplyAck = 34,
    TokenRenew = 37,
    TokenRenewResponse = 38,
    RequestDevices = 240,
    RequestRooms = 242,
    DeviceDim = 280,
    DeviceSwitch = 281,
    RoomDim = 283,
    RoomSwitch = 284,
    ActivateScene = 285,
    ErrorInfo = 295,
    SetAllData = 300,
    SetHomeData = 303,
    LogData = 304,
    StateUpdate = 310,
    SetBridgeState = 364,
    LogEntries = 408,
}

impl MessageType {
    /// Map a wire `type_int` to a known message type.
    pub fn from_int(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Nack),
            1 => Some(Self::Ack),
            2 => Some(Self::Heartbeat),
            3 => Some(Self::Ping),
            10 => Some(Self::ConnectionStart),
            11 => Some(Self::ConnectionConfirm),
            12 => Some(Self::ScInitResponse),
            13 => Some(Self::ConnectionDeclined),
            14 => Some(Self::ScInitRequest),
            15 => Some(Self::PublicKeyResponse),
            16 => Some(Self::SecretExchange),
            17 => Some(Self::SecretExchangeAck),
            30 => Some(Self::LoginRequest),
            32 => Some(Self::LoginResponse),
            33 => Some(Self::TokenApply),
            34 => Some(Self::TokenApplyAck),
            37 => Some(Self::TokenRenew),
            38 => Some(Self::TokenRenewResponse),
            240 => Some(Self::RequestDevices),
            242 => Some(Self::RequestRooms),
            280 => Some(Self::DeviceDim),
            281 => Some(Self::DeviceSwitch),
            283 => Some(Self::RoomDim),
            284 => Some(Self::RoomSwitch),
            285 => Some(Self::ActivateScene),
            295 => Some(Self::ErrorInfo),
            300 => Some(Self::SetAllData),
            303 => Some(Self::SetHomeData),
            304 => Some(Self::LogData),
            310 => Some(Self::StateUpdate),
            364 => Some(Self::SetBridgeState),
            408 => Some(Self::LogEntries),
            _ => None,
        }
    }

    /// Wire value of this message type.
    pub fn to_int(self) -> u16 {
        self as u16
    }

    /// Whether this inbound type belongs to the handshake/token flow.
    pub fn is_auth_flow(self) -> bool {
        matches!(
            self,
            Self::ConnectionStart
                | Self::ScInitResponse
                | Self::ConnectionDeclined
                | Self::ScInitRequest
                | Self::PublicKeyResponse
                | Self::SecretExchangeAck
                | Self::LoginResponse
                | Self::TokenApplyAck
                | Self::TokenRenewResponse
        )
    }
}

/// Build the envelope for a client-originated message.
///
/// `mc` is absent only for acknowledgement frames.
pub fn envelope(message_type: MessageType, mc: Option<u64>, payload: Value) -> Value {
    let mut fields = Map::new();
    fields.insert("type_int".into(), json!(message_type.to_int()));
    if let Some(mc) = mc {
        fields.insert("mc".into(), json!(mc));
    }
    if !payload.is_null() {
        fields.insert("payload".into(), payload);
    }
    Value::Object(fields)
}

/// Build the mandatory acknowledgement for an inbound `mc`.
pub fn ack_envelope(ref_mc: u64) -> Value {
    json!({"type_int": MessageType::Ack.to_int(), "ref": ref_mc})
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Raw wire type; may be unknown to this client version.
    pub type_int: u16,

    /// Counter the bridge attached; must be acknowledged immediately.
    pub mc: Option<u64>,

    /// Counter referenced by an ACK/NACK frame.
    pub ref_mc: Option<u64>,

    /// Free-text info attached to NACK/ErrorInfo frames.
    pub info: Option<String>,

    /// Message payload; `Value::Null` when absent.
    pub payload: Value,
}

impl InboundMessage {
    /// Decode an envelope. Returns `None` when `type_int` is missing or not
    /// an integer, which marks the frame as undecodable noise.
    pub fn parse(value: Value) -> Option<Self> {
        let type_int = value.get("type_int")?.as_u64()?;

        let info = value
            .get("info")
            .or_else(|| value.get("payload").and_then(|p| p.get("info")))
            .and_then(Value::as_str)
            .map(str::to_owned);

        Some(Self {
            type_int: type_int as u16,
            mc: value.get("mc").and_then(Value::as_u64),
            ref_mc: value.get("ref").and_then(Value::as_u64),
            info,
            payload: value.get("payload").cloned().unwrap_or(Value::Null),
        })
    }

    /// Known message type, if this client version recognizes it.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_int(self.type_int)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for t in [
            MessageType::Nack,
            MessageType::Ack,
            MessageType::Heartbeat,
            MessageType::ConnectionStart,
            MessageType::SecretExchange,
            MessageType::LoginRequest,
            MessageType::RequestDevices,
            MessageType::ActivateScene,
            MessageType::StateUpdate,
            MessageType::LogEntries,
        ] {
            assert_eq!(MessageType::from_int(t.to_int()), Some(t));
        }
        assert_eq!(MessageType::from_int(999), None);
    }

    #[test]
    fn test_envelope_shape() {
        let msg = envelope(
            MessageType::DeviceSwitch,
            Some(12),
            serde_json::json!({"deviceId": "D1", "switch": true}),
        );
        assert_eq!(msg["type_int"], 281);
        assert_eq!(msg["mc"], 12);
        assert_eq!(msg["payload"]["switch"], true);

        let hb = envelope(MessageType::Heartbeat, Some(3), Value::Null);
        assert_eq!(hb["type_int"], 2);
        assert!(hb.get("payload").is_none());
    }

    #[test]
    fn test_ack_envelope_has_no_mc() {
        let ack = ack_envelope(100);
        assert_eq!(ack["type_int"], 1);
        assert_eq!(ack["ref"], 100);
        assert!(ack.get("mc").is_none());
    }

    #[test]
    fn test_parse_inbound() {
        let msg = InboundMessage::parse(serde_json::json!({
            "type_int": 310,
            "mc": 100,
            "payload": {"item": []}
        }))
        .unwrap();
        assert_eq!(msg.type_int, 310);
        assert_eq!(msg.mc, Some(100));
        assert_eq!(msg.message_type(), Some(MessageType::StateUpdate));

        let nack = InboundMessage::parse(serde_json::json!({
            "type_int": 0,
            "ref": 41,
            "info": "device busy"
        }))
        .unwrap();
        assert_eq!(nack.ref_mc, Some(41));
        assert_eq!(nack.info.as_deref(), Some("device busy"));

        assert!(InboundMessage::parse(serde_json::json!({"no_type": 1})).is_none());
    }

    #[test]
    fn test_parse_info_nested_in_payload() {
        let msg = InboundMessage::parse(serde_json::json!({
            "type_int": 295,
            "payload": {"info": "relay fault"}
        }))
        .unwrap();
        assert_eq!(msg.info.as_deref(), Some("relay fault"));
    }

    #[test]
    fn test_auth_flow_classification() {
        assert!(MessageType::ConnectionStart.is_auth_flow());
        assert!(MessageType::TokenRenewResponse.is_auth_flow());
        assert!(!MessageType::StateUpdate.is_auth_flow());
        assert!(!MessageType::Ack.is_auth_flow());
    }
}
