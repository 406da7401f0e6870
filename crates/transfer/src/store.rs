//! Object-store backend abstraction.

use std::future::Future;
use std::pin::Pin;

use uplift_protocol::CompletedPart;

use crate::TransferError;

/// Boxed future returned by [`ObjectStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Metadata returned by a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: Option<String>,
}

impl ObjectMeta {
    /// The entity tag when it is a plain content MD5.
    ///
    /// Multipart entity tags (`<hex>-<parts>`) are not content digests and
    /// yield `None`.
    pub fn plain_etag(&self) -> Option<&str> {
        let etag = self.etag.as_deref()?.trim_matches('"');
        let is_md5 = etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit());
        is_md5.then_some(etag)
    }
}

/// S3-style object operations.
///
/// Every call authorizes itself immediately before sending; implementations
/// never reuse a signature across calls.
pub trait ObjectStore: Send + Sync {
    /// Returns object metadata, or `None` if the key does not exist.
    fn head_object<'a>(&'a self, bucket: &'a str, key: &'a str)
    -> StoreFuture<'a, Option<ObjectMeta>>;

    /// Stores `body` in one request and returns the entity tag.
    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        body: Vec<u8>,
        checksum: Option<String>,
    ) -> StoreFuture<'a, String>;

    /// Initiates a multipart upload and returns its upload id.
    fn create_multipart<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, String>;

    /// Stores one part and returns its entity tag.
    ///
    /// `checksum` is the base64 SHA-256 of `body` when part checksums are on.
    fn upload_part<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
        checksum: Option<String>,
    ) -> StoreFuture<'a, String>;

    /// Assembles `parts` (sorted by part number) and returns the final entity tag.
    fn complete_multipart<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, String>;

    /// Releases the storage of an unfinished multipart upload.
    fn abort_multipart<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()>;
}
