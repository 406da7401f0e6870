//! SigV4 request signing for S3-compatible object stores.
//!
//! Signing is a pure function of a credential snapshot, the request shape
//! and a timestamp. Every network call signs immediately before sending;
//! signatures are never cached.

mod canonical;
mod credentials;
mod signer;

pub use canonical::{canonical_query, encode_path, encode_uri_component, sha256_hex};
pub use credentials::{
    CredentialProvider, Credentials, EnvCredentialProvider, StaticCredentialProvider,
};
pub use signer::{
    ALGORITHM, PresignedUrl, RequestSigner, SignableRequest, SignedHeaders, UNSIGNED_PAYLOAD,
};

/// Longest validity accepted for a presigned URL (7 days).
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

/// Errors produced while signing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignerError {
    #[error("no credentials available")]
    NoCredentials,

    #[error("credentials expired at {0}")]
    ExpiredCredentials(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid expiry: {0}s (max {MAX_PRESIGN_EXPIRY_SECS}s)")]
    InvalidExpiry(u64),
}
