//! Login password derivation
//!
//! The bridge login password is a double SHA-256 over UTF-8 bytes:
//! `sha256_hex(salt ++ sha256_hex(device_id ++ auth_key))`, lowercase hex
//! throughout. The salt travels alongside the hash in the login payload.

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use sha2::{Digest, Sha256};

/// Default salt length used by the login flow.
pub const DEFAULT_SALT_LENGTH: usize = 32;

/// Derive the login password for `(device_id, auth_key, salt)`.
pub fn auth_hash(device_id: &str, auth_key: &str, salt: &str) -> String {
    let inner = sha256_hex(format!("{}{}", device_id, auth_key).as_bytes());
    sha256_hex(format!("{}{}", salt, inner).as_bytes())
}

/// Generate a random `[A-Za-z0-9]` salt from the OS entropy source.
pub fn generate_salt(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
