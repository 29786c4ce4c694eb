//! Session error types

use thiserror::Error;

/// Errors surfaced by the session core
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection is not open")]
    NotConnected,

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    RetriesExhausted { attempts: u32 },

    #[error("Channel closed")]
    ChannelClosed,
}
