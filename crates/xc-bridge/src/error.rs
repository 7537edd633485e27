//! Error taxonomy for the bridge client

use std::time::Duration;

use crate::crypto::codec::CodecError;
use crate::crypto::keyexchange::KeyExchangeError;

/// Errors surfaced by the bridge client.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Bridge IP or auth key missing at `init()` time.
    #[error("bridge ip or auth key not configured")]
    ConfigMissing,

    /// Handshake or discovery did not complete within the connect window.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The bridge refused the handshake (message type 13).
    #[error("bridge declined the connection")]
    ConnectionDeclined,

    /// Login did not yield a token.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A mutating call was made without an authenticated session.
    #[error("not connected to the bridge")]
    NotConnected,

    /// Bad id, bad type or out-of-range value passed to a facade method.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Retries exhausted on an outbound command.
    #[error("no acknowledgement after {attempts} attempts")]
    AckTimeout { attempts: u32 },

    /// A frame failed to decrypt or parse.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The RSA key wrap failed or the bridge key was unusable.
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),

    /// The peer closed the socket or the transport faulted.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The WebSocket or TCP layer failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

/// Common result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
