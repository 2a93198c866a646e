//! Error types for wsio channels
//!
//! Simple, flat error hierarchy. Only codec and transport problems live
//! here: connection lifecycle outcomes are reported through the reserved
//! events, never as errors at a call site.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WsioError>;

#[derive(Debug, Error)]
pub enum WsioError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid address: {0}")]
    Address(#[from] url::ParseError),

    #[error("Frame is not a JSON array")]
    FrameNotArray,

    #[error("Frame is missing a leading event name")]
    MissingEventName,

    #[error("Reserved event name: {0}")]
    Reserved(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
