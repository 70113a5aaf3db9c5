//! Bridge error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by the session bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Upstream HTTP call failed (network, timeout, or protocol).
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Realtime transport failed (handshake or socket I/O).
    #[error("realtime transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// An acknowledgment write was rejected by the upstream.
    #[error("acknowledgment write failed: {0}")]
    AckWrite(String),

    /// Invalid or missing configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Create an acknowledgment-write error.
    pub fn ack_write(msg: impl Into<String>) -> Self {
        Self::AckWrite(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
