//! Error types for HrvXo
//!
//! The measurement core never fails; these errors only surface at the edges
//! (configuration, event decoding, result persistence, I/O).

use thiserror::Error;

/// Errors raised outside the infallible measurement core
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Result sink rejected result: {0}")]
    Sink(String),

    #[error("Session loop stopped: {0}")]
    LoopStopped(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
