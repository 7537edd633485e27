//! Cryptography for the bridge session
//!
//! The bridge protocol uses dual-layer encryption:
//! 1. RSA (PKCS#1 v1.5) to wrap a locally generated AES secret during the
//!    handshake (message types 15/16)
//! 2. AES-256-CBC with protocol-specific null padding for every frame after
//!    the secret exchange

pub mod authhash;
pub mod codec;
pub mod keyexchange;

pub use codec::EncryptionContext;
