//! Single-shot and resumable multipart uploads to S3-compatible stores.
//!
//! [`TransferClient`] drives one object upload through an [`ObjectStore`]
//! backend, pacing every byte through the shared bandwidth throttler and
//! keeping [`MultipartState`](uplift_protocol::MultipartState) current so an
//! interrupted upload resumes from the next unsent part.

mod chunked;
mod client;
mod http;
mod memory;
mod progress;
mod resume;
mod store;
mod types;
mod validation;
mod xml;

use std::time::Duration;

use uplift_signer::SignerError;

pub use chunked::{PartReader, checksum_bytes, content_md5, md5_hex, sha256_base64};
pub use client::{TransferClient, TransferOptions, TransferSignals, UploadReport};
pub use http::{HttpObjectStore, HttpStoreConfig, SigningMode};
pub use memory::{FaultKind, MemoryObjectStore, StoreOp};
pub use progress::SpeedCalculator;
pub use resume::{ResumeError, ResumeRecord, ResumeStore};
pub use store::{ObjectMeta, ObjectStore, StoreFuture};
pub use types::{PartPlan, PartRange, TransferRequest};
pub use validation::{validate_bucket_name, validate_object_key, validate_source};

const MIB: u64 = 1024 * 1024;

/// Smallest size of any part but the last.
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Default part size.
pub const DEFAULT_PART_SIZE: u64 = 8 * MIB;

/// Files at or above this size use multipart upload by default.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 16 * MIB;

/// Most parts one multipart upload may have.
pub const MAX_PARTS: u32 = 10_000;

/// Largest object the store accepts (5 TiB).
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * MIB;

/// Largest file sent as one PUT. The body is held in memory, so bigger
/// files always go through multipart upload whatever the threshold.
pub const MAX_SINGLE_PUT_SIZE: u64 = 64 * MIB;

/// Longest object key in UTF-8 bytes.
pub const MAX_KEY_BYTES: usize = 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("multipart upload failed: {0}")]
    MultipartUploadFailed(String),

    #[error("multipart upload no longer exists: {0}")]
    NoSuchUpload(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("store returned {status} {code}: {message}")]
    Http {
        status: u16,
        code: String,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("invalid bucket name: {0}")]
    InvalidBucket(String),

    #[error("object key is {0} bytes (max {MAX_KEY_BYTES})")]
    KeyTooLong(usize),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("file is {0} bytes (max {MAX_OBJECT_SIZE})")]
    FileTooLarge(u64),

    #[error("source changed size: expected {expected} bytes, found {actual}")]
    SourceChanged { expected: u64, actual: u64 },

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),

    #[error("upload cancelled")]
    Cancelled,

    #[error("upload paused")]
    Paused,
}

impl TransferError {
    /// Returns `true` for transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_)
            | Self::Timeout(_)
            | Self::MultipartUploadFailed(_)
            | Self::NoSuchUpload(_)
            | Self::InvalidResponse(_) => true,
            Self::Http { status, code, .. } => {
                *status >= 500
                    || *status == 429
                    || matches!(code.as_str(), "RequestTimeout" | "SlowDown" | "InternalError")
            }
            _ => false,
        }
    }

    /// Returns `true` when signing failed only because credentials expired.
    ///
    /// Such failures become retryable once the provider refreshes.
    pub fn is_expired_credentials(&self) -> bool {
        matches!(self, Self::Signing(SignerError::ExpiredCredentials(_)))
    }

    /// `Cancelled` and `Paused` are control outcomes, not failures.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_taxonomy() {
        assert!(TransferError::Network("reset".into()).is_retryable());
        assert!(TransferError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(TransferError::MultipartUploadFailed("x".into()).is_retryable());
        assert!(TransferError::InvalidResponse("x".into()).is_retryable());

        assert!(!TransferError::AccessDenied("x".into()).is_retryable());
        assert!(!TransferError::Authentication("x".into()).is_retryable());
        assert!(!TransferError::BucketNotFound("x".into()).is_retryable());
        assert!(!TransferError::KeyTooLong(2000).is_retryable());
        assert!(!TransferError::FileTooLarge(1).is_retryable());
        assert!(!TransferError::ChecksumMismatch("x".into()).is_retryable());
        assert!(!TransferError::Signing(SignerError::NoCredentials).is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
        assert!(!TransferError::Paused.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = |status: u16, code: &str| TransferError::Http {
            status,
            code: code.into(),
            message: String::new(),
        };
        assert!(err(503, "ServiceUnavailable").is_retryable());
        assert!(err(400, "RequestTimeout").is_retryable());
        assert!(!err(400, "InvalidArgument").is_retryable());
    }

    #[test]
    fn expired_credentials_are_flagged() {
        let err = TransferError::from(SignerError::ExpiredCredentials("t".into()));
        assert!(err.is_expired_credentials());
        assert!(!err.is_retryable());
    }
}
