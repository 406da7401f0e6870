//! Manager error types.

use std::path::PathBuf;

use uplift_protocol::{JobId, JobStatus};
use uplift_transfer::TransferError;

/// Reasons a job is refused at enqueue time.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("cannot read source {path:?}: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("destination bucket is empty")]
    EmptyBucket,

    #[error("destination key is empty")]
    EmptyKey,

    #[error("invalid bucket name: {0}")]
    InvalidBucket(String),

    #[error("object key is {0} bytes (max {max})", max = uplift_transfer::MAX_KEY_BYTES)]
    KeyTooLong(usize),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("file is {0} bytes (max {max})", max = uplift_transfer::MAX_OBJECT_SIZE)]
    FileTooLarge(u64),
}

impl EnqueueError {
    pub(crate) fn from_transfer(path: &std::path::Path, err: TransferError) -> Self {
        match err {
            TransferError::InvalidBucket(msg) => Self::InvalidBucket(msg),
            TransferError::KeyTooLong(len) => Self::KeyTooLong(len),
            TransferError::InvalidKey(msg) => Self::InvalidKey(msg),
            TransferError::FileTooLarge(size) => Self::FileTooLarge(size),
            other => Self::SourceUnreadable {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }
}

/// Errors from job control operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("job {id} is {status} and cannot be retried")]
    NotRetryable { id: JobId, status: JobStatus },
}

/// Errors from the history store.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
