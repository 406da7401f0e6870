//! Error types for the control channel.

/// Errors produced while serving or calling the control protocol.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("connection timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Rejected(String),
}
