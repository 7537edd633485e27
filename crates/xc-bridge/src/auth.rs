//! Handshake and token-renewal state machine
//!
//! Drives the session from TCP-up to the authenticated phase:
//!
//! 1. Bridge opens with ConnectionStart (10); client confirms (11)
//! 2. ScInit exchange (12/14), with a defensive branch re-answering an
//!    echoed 14 (older firmwares race here)
//! 3. Bridge advertises its RSA public key (15); client generates the AES
//!    context and returns the wrapped secret (16)
//! 4. Encrypted from here: login (30/32) with the double-SHA password,
//!    then the token dance 33→34→37→38→33→34
//!
//! The machine owns no I/O: each inbound message yields the frames to send,
//! whether the encrypted channel must be armed, and whether the terminal
//! phase was reached. The surrounding session tasks do the rest.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{CLIENT_ID, CLIENT_TYPE, CLIENT_VERSION};
use crate::crypto::authhash::{auth_hash, generate_salt};
use crate::crypto::codec::EncryptionContext;
use crate::crypto::keyexchange;
use crate::error::{BridgeError, Result};
use crate::protocol::{InboundMessage, MessageType};

/// Authentication phases, in handshake order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    AwaitingScInit,
    AwaitingPublicKey,
    AwaitingSecretAck,
    AwaitingLoginResponse,
    AwaitingTokenApply,
    AwaitingTokenRenew,
    AwaitingTokenApplyFinal,
    Authenticated,
}

/// A frame the authenticator wants on the wire.
#[derive(Debug)]
pub enum AuthSend {
    /// Plain JSON, pre-secret-exchange.
    Plain(MessageType, Value),
    /// AES-encrypted via the armed context.
    Encrypted(MessageType, Value),
}

/// Result of feeding one inbound message to the machine.
#[derive(Debug, Default)]
pub struct AuthOutput {
    /// Frames to transmit, in order.
    pub outbound: Vec<AuthSend>,

    /// Context to arm on the codec, generated on PublicKeyResponse. The
    /// writer must arm it after the plaintext frames queued above.
    pub arm_encryption: Option<EncryptionContext>,

    /// Set when the terminal phase was just reached.
    pub authenticated: bool,
}

/// The per-session authenticator.
pub struct Authenticator {
    phase: AuthPhase,
    auth_key: String,
    salt_length: usize,
    device_id: Option<String>,
    connection_id: Option<String>,
    token: Option<String>,
}

impl Authenticator {
    pub fn new(auth_key: impl Into<String>, salt_length: usize) -> Self {
        Self {
            phase: AuthPhase::Idle,
            auth_key: auth_key.into(),
            salt_length,
            device_id: None,
            connection_id: None,
            token: None,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    /// Bridge-advertised device id, known once ConnectionStart arrived.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Feed one inbound auth-flow message.
    ///
    /// Unexpected types for the current phase are logged and ignored;
    /// ConnectionDeclined aborts the session.
    pub fn on_message(&mut self, msg: &InboundMessage) -> Result<AuthOutput> {
        let Some(message_type) = msg.message_type() else {
            return Ok(self.ignore(msg));
        };

        if message_type == MessageType::ConnectionDeclined {
            return Err(BridgeError::ConnectionDeclined);
        }

        match (self.phase, message_type) {
            (AuthPhase::Idle, MessageType::ConnectionStart) => self.on_connection_start(msg),
            (AuthPhase::AwaitingScInit, MessageType::ScInitResponse) => {
                self.phase = AuthPhase::AwaitingPublicKey;
                Ok(send_one(AuthSend::Plain(MessageType::ScInitRequest, Value::Null)))
            }
            (AuthPhase::AwaitingPublicKey, MessageType::ScInitRequest) => {
                // Older firmwares echo our request back; answer it again.
                debug!("ScInitRequest echoed by bridge, re-sending");
                Ok(send_one(AuthSend::Plain(MessageType::ScInitRequest, Value::Null)))
            }
            (AuthPhase::AwaitingPublicKey, MessageType::PublicKeyResponse) => {
                self.on_public_key(msg)
            }
            (AuthPhase::AwaitingSecretAck, MessageType::SecretExchangeAck) => self.on_secret_ack(),
            (AuthPhase::AwaitingLoginResponse, MessageType::LoginResponse) => {
                self.on_login_response(msg)
            }
            (AuthPhase::AwaitingTokenApply, MessageType::TokenApplyAck) => {
                let token = self.current_token()?;
                self.phase = AuthPhase::AwaitingTokenRenew;
                Ok(send_one(AuthSend::Encrypted(
                    MessageType::TokenRenew,
                    json!({"token": token}),
                )))
            }
            (AuthPhase::AwaitingTokenRenew, MessageType::TokenRenewResponse) => {
                self.on_token_renewed(msg)
            }
            (AuthPhase::AwaitingTokenApplyFinal, MessageType::TokenApplyAck) => {
                self.phase = AuthPhase::Authenticated;
                debug!("Authentication complete");
                Ok(AuthOutput { authenticated: true, ..Default::default() })
            }
            _ => Ok(self.ignore(msg)),
        }
    }

    fn on_connection_start(&mut self, msg: &InboundMessage) -> Result<AuthOutput> {
        self.device_id = msg
            .payload
            .get("deviceId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        self.connection_id = msg
            .payload
            .get("connectionId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        self.phase = AuthPhase::AwaitingScInit;

        Ok(send_one(AuthSend::Plain(
            MessageType::ConnectionConfirm,
            json!({
                "clientType": CLIENT_TYPE,
                "clientId": CLIENT_ID,
                "clientVersion": CLIENT_VERSION,
                "connectionId": self.connection_id,
            }),
        )))
    }

    fn on_public_key(&mut self, msg: &InboundMessage) -> Result<AuthOutput> {
        let pem = msg
            .payload
            .get("publicKey")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::AuthFailed("public key response without key".into()))?;

        let bridge_key = keyexchange::parse_public_key(pem)?;
        let ctx = EncryptionContext::generate();
        let secret = keyexchange::wrap_secret(&ctx, &bridge_key)?;

        self.phase = AuthPhase::AwaitingSecretAck;
        Ok(AuthOutput {
            outbound: vec![AuthSend::Plain(
                MessageType::SecretExchange,
                json!({"secret": secret}),
            )],
            arm_encryption: Some(ctx),
            authenticated: false,
        })
    }

    fn on_secret_ack(&mut self) -> Result<AuthOutput> {
        let device_id = self
            .device_id
            .clone()
            .ok_or_else(|| BridgeError::AuthFailed("no device id from ConnectionStart".into()))?;

        let salt = generate_salt(self.salt_length);
        let password = auth_hash(&device_id, &self.auth_key, &salt);

        self.phase = AuthPhase::AwaitingLoginResponse;
        Ok(send_one(AuthSend::Encrypted(
            MessageType::LoginRequest,
            json!({"username": "default", "password": password, "salt": salt}),
        )))
    }

    fn on_login_response(&mut self, msg: &InboundMessage) -> Result<AuthOutput> {
        let token = msg
            .payload
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BridgeError::AuthFailed("login yielded no token".into()))?
            .to_owned();

        self.phase = AuthPhase::AwaitingTokenApply;
        let output = send_one(AuthSend::Encrypted(
            MessageType::TokenApply,
            json!({"token": token}),
        ));
        self.token = Some(token);
        Ok(output)
    }

    fn on_token_renewed(&mut self, msg: &InboundMessage) -> Result<AuthOutput> {
        let token = msg
            .payload
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BridgeError::AuthFailed("token renewal yielded no token".into()))?
            .to_owned();

        self.phase = AuthPhase::AwaitingTokenApplyFinal;
        let output = send_one(AuthSend::Encrypted(
            MessageType::TokenApply,
            json!({"token": token}),
        ));
        self.token = Some(token);
        Ok(output)
    }

    fn current_token(&self) -> Result<String> {
        self.token
            .clone()
            .ok_or_else(|| BridgeError::AuthFailed("no token to renew".into()))
    }

    fn ignore(&self, msg: &InboundMessage) -> AuthOutput {
        warn!(
            type_int = msg.type_int,
            phase = ?self.phase,
            "Unexpected message during authentication, ignoring"
        );
        AuthOutput::default()
    }
}

fn send_one(send: AuthSend) -> AuthOutput {
    AuthOutput {
        outbound: vec![send],
        arm_encryption: None,
        authenticated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose, Engine as _};
    use rand::rngs::OsRng;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

    fn inbound(type_int: u16, payload: Value) -> InboundMessage {
        InboundMessage::parse(json!({"type_int": type_int, "payload": payload})).unwrap()
    }

    fn expect_send(output: &AuthOutput) -> (&MessageType, &Value, bool) {
        match &output.outbound[..] {
            [AuthSend::Plain(t, p)] => (t, p, false),
            [AuthSend::Encrypted(t, p)] => (t, p, true),
            other => panic!("expected exactly one frame, got {:?}", other),
        }
    }

    #[test]
    fn test_full_handshake_walk() {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pem = RsaPublicKey::from(&private)
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        let mut auth = Authenticator::new("my-auth-key", 32);
        assert_eq!(auth.phase(), AuthPhase::Idle);

        // 10 -> 11
        let output = auth
            .on_message(&inbound(10, json!({"deviceId": "BR-7", "connectionId": "c-1"})))
            .unwrap();
        let (t, p, encrypted) = expect_send(&output);
        assert_eq!(*t, MessageType::ConnectionConfirm);
        assert!(!encrypted);
        assert_eq!(p["connectionId"], "c-1");
        assert_eq!(auth.phase(), AuthPhase::AwaitingScInit);
        assert_eq!(auth.device_id(), Some("BR-7"));

        // 12 -> 14
        let output = auth.on_message(&inbound(12, Value::Null)).unwrap();
        let (t, _, encrypted) = expect_send(&output);
        assert_eq!(*t, MessageType::ScInitRequest);
        assert!(!encrypted);

        // Echoed 14 -> 14, phase unchanged
        let output = auth.on_message(&inbound(14, Value::Null)).unwrap();
        let (t, _, _) = expect_send(&output);
        assert_eq!(*t, MessageType::ScInitRequest);
        assert_eq!(auth.phase(), AuthPhase::AwaitingPublicKey);

        // 15 -> 16 plaintext, encryption armed
        let output = auth
            .on_message(&inbound(15, json!({"publicKey": pem})))
            .unwrap();
        let ctx = output.arm_encryption.as_ref().expect("context armed");
        let (t, p, encrypted) = expect_send(&output);
        assert_eq!(*t, MessageType::SecretExchange);
        assert!(!encrypted);

        // The wrapped secret unwraps to this session's key and iv.
        let wrapped = general_purpose::STANDARD
            .decode(p["secret"].as_str().unwrap())
            .unwrap();
        let secret = String::from_utf8(private.decrypt(Pkcs1v15Encrypt, &wrapped).unwrap()).unwrap();
        let (key_hex, iv_hex) = secret.split_once(":::").unwrap();
        assert_eq!(hex::decode(key_hex).unwrap(), ctx.key());
        assert_eq!(hex::decode(iv_hex).unwrap(), ctx.iv());

        // 17 -> 30 with the double-SHA password
        let output = auth.on_message(&inbound(17, Value::Null)).unwrap();
        let (t, p, encrypted) = expect_send(&output);
        assert_eq!(*t, MessageType::LoginRequest);
        assert!(encrypted);
        assert_eq!(p["username"], "default");
        let salt = p["salt"].as_str().unwrap();
        assert_eq!(salt.len(), 32);
        assert_eq!(
            p["password"].as_str().unwrap(),
            auth_hash("BR-7", "my-auth-key", salt)
        );

        // 32 -> 33
        let output = auth
            .on_message(&inbound(32, json!({"token": "T0"})))
            .unwrap();
        let (t, p, _) = expect_send(&output);
        assert_eq!(*t, MessageType::TokenApply);
        assert_eq!(p["token"], "T0");

        // 34 -> 37
        let output = auth.on_message(&inbound(34, Value::Null)).unwrap();
        let (t, p, _) = expect_send(&output);
        assert_eq!(*t, MessageType::TokenRenew);
        assert_eq!(p["token"], "T0");

        // 38 -> 33 with the renewed token
        let output = auth
            .on_message(&inbound(38, json!({"token": "T1"})))
            .unwrap();
        let (t, p, _) = expect_send(&output);
        assert_eq!(*t, MessageType::TokenApply);
        assert_eq!(p["token"], "T1");

        // Final 34 -> authenticated
        let output = auth.on_message(&inbound(34, Value::Null)).unwrap();
        assert!(output.outbound.is_empty());
        assert!(output.authenticated);
        assert_eq!(auth.phase(), AuthPhase::Authenticated);
    }

    #[test]
    fn test_connection_declined_is_fatal() {
        let mut auth = Authenticator::new("key", 32);
        auth.on_message(&inbound(10, json!({"deviceId": "BR", "connectionId": "c"})))
            .unwrap();

        assert!(matches!(
            auth.on_message(&inbound(13, Value::Null)),
            Err(BridgeError::ConnectionDeclined)
        ));
    }

    #[test]
    fn test_unexpected_messages_are_ignored() {
        let mut auth = Authenticator::new("key", 32);

        // Login response while idle changes nothing.
        let output = auth
            .on_message(&inbound(32, json!({"token": "T0"})))
            .unwrap();
        assert!(output.outbound.is_empty());
        assert_eq!(auth.phase(), AuthPhase::Idle);
    }

    #[test]
    fn test_login_without_token_fails() {
        let mut auth = Authenticator::new("key", 32);
        auth.on_message(&inbound(10, json!({"deviceId": "BR", "connectionId": "c"})))
            .unwrap();
        auth.phase = AuthPhase::AwaitingLoginResponse;

        assert!(matches!(
            auth.on_message(&inbound(32, json!({}))),
            Err(BridgeError::AuthFailed(_))
        ));
        assert!(matches!(
            auth.on_message(&inbound(32, json!({"token": ""}))),
            Err(BridgeError::AuthFailed(_))
        ));
    }

    #[test]
    fn test_short_bridge_key_rejected() {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pem = RsaPublicKey::from(&private)
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        let mut auth = Authenticator::new("key", 32);
        auth.on_message(&inbound(10, json!({"deviceId": "BR", "connectionId": "c"})))
            .unwrap();
        auth.on_message(&inbound(12, Value::Null)).unwrap();

        assert!(matches!(
            auth.on_message(&inbound(15, json!({"publicKey": pem}))),
            Err(BridgeError::KeyExchange(_))
        ));
    }
}
