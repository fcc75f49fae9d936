//! Internal error types for the hub crate.

use thiserror::Error;

/// Result alias for hub-internal operations.
pub type HubResult<T> = Result<T, HubError>;

/// Errors produced by the hub's transport and configuration plumbing.
///
/// Caller-facing routing outcomes use [`unibridge_core::BridgeError`];
/// `HubError` covers the machinery underneath (socket accept, config
/// load, frame codec).
#[derive(Debug, Error)]
pub enum HubError {
    /// `WebSocket` transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// I/O error (bind, accept, file read).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration parse error.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration rejected by validation.
    #[error("config error: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
