//! Dedup error types.

use uplift_transfer::TransferError;

/// Errors produced while fingerprinting or checking for duplicates.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash task failed: {0}")]
    Task(String),

    #[error("remote check failed: {0}")]
    Remote(#[from] TransferError),
}
