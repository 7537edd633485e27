//! RSA wrap of the session secret
//!
//! When the bridge advertises its public key (message type 15), the client
//! generates a fresh AES context and sends it back wrapped: the ASCII string
//! `hex(key):::hex(iv)` is RSA-encrypted with PKCS#1 v1.5 padding and
//! base64-encoded into the SecretExchange payload (message type 16).

use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};

use super::codec::EncryptionContext;

/// Delimiter between the hex-encoded key and IV inside the wrapped secret.
pub const SECRET_DELIMITER: &str = ":::";

/// Minimum accepted bridge key size.
pub const MIN_RSA_BITS: usize = 2048;

/// Errors from parsing the bridge key or wrapping the secret.
#[derive(Debug, thiserror::Error)]
pub enum KeyExchangeError {
    #[error("bridge public key is not valid PEM: {0}")]
    InvalidKey(String),

    #[error("bridge public key too short: {bits} bits (need at least {MIN_RSA_BITS})")]
    KeyTooShort { bits: usize },

    #[error("rsa encryption failed: {0}")]
    EncryptFailed(String),
}

/// Parse the bridge's PEM-encoded RSA public key.
///
/// Bridges in the field emit both SPKI (`BEGIN PUBLIC KEY`) and PKCS#1
/// (`BEGIN RSA PUBLIC KEY`) encodings depending on firmware, so try both.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, KeyExchangeError> {
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| KeyExchangeError::InvalidKey(e.to_string()))?;

    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(KeyExchangeError::KeyTooShort { bits });
    }

    Ok(key)
}

/// Wrap a freshly generated AES context for the bridge.
///
/// Returns the base64 ciphertext carried in the SecretExchange payload.
pub fn wrap_secret(
    ctx: &EncryptionContext,
    bridge_key: &RsaPublicKey,
) -> Result<String, KeyExchangeError> {
    let secret = format!(
        "{}{}{}",
        hex::encode(ctx.key()),
        SECRET_DELIMITER,
        hex::encode(ctx.iv())
    );

    let mut rng = OsRng;
    let wrapped = bridge_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, secret.as_bytes())
        .map_err(|e| KeyExchangeError::EncryptFailed(e.to_string()))?;

    Ok(general_purpose::STANDARD.encode(wrapped))
}
