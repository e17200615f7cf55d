//! Crate-level error type.

use thiserror::Error;

/// Everything that can go wrong outside of wire decoding.
///
/// Decoding failures have their own type, [`crate::protocol::ProtocolError`],
/// because they are delivered to listeners rather than returned.
#[derive(Debug, Error)]
pub enum CollabError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file is not valid TOML for [`crate::config::AppConfig`].
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The endpoint is not a `ws://` or `wss://` URL.
    #[error("invalid endpoint '{0}': expected ws:// or wss://")]
    InvalidEndpoint(String),

    /// The peer went away while an operation was in flight.
    #[error("connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, CollabError>;
