//! In-process `ObjectStore` with latency and fault injection.
//!
//! Used by tests and local dry runs. Entity tags follow S3: the quoted hex
//! MD5 of the body for single PUTs, and the MD5 of the concatenated part
//! digests suffixed with `-<parts>` for multipart objects.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use md5::{Digest, Md5};
use tracing::trace;
use uplift_protocol::CompletedPart;
use uplift_signer::{CredentialProvider, RequestSigner, SignableRequest};

use crate::chunked::{md5_hex, sha256_base64};
use crate::store::{ObjectMeta, ObjectStore, StoreFuture};
use crate::{MIN_PART_SIZE, TransferError};

/// Store operation, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Head,
    Put,
    CreateMultipart,
    UploadPart,
    CompleteMultipart,
    AbortMultipart,
}

/// Injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fails immediately with [`TransferError::Timeout`].
    Timeout,
    /// Never answers; the caller's own timeout has to fire.
    Hang,
    Network,
    ServerError,
    AccessDenied,
    NoSuchUpload,
}

impl FaultKind {
    fn into_error(self) -> TransferError {
        match self {
            Self::Timeout | Self::Hang => TransferError::Timeout(Duration::ZERO),
            Self::Network => TransferError::Network("connection reset by peer".into()),
            Self::ServerError => TransferError::Http {
                status: 500,
                code: "InternalError".into(),
                message: "We encountered an internal error. Please try again.".into(),
            },
            Self::AccessDenied => TransferError::AccessDenied("Access Denied".into()),
            Self::NoSuchUpload => {
                TransferError::NoSuchUpload("The specified upload does not exist.".into())
            }
        }
    }
}

struct StoredObject {
    data: Vec<u8>,
    etag: String,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<(String, String), StoredObject>,
    buckets: Option<HashSet<String>>,
    uploads: HashMap<String, PendingUpload>,
    faults: HashMap<StoreOp, VecDeque<FaultKind>>,
    calls: HashMap<StoreOp, usize>,
    sent_parts: Vec<u32>,
    next_upload: u64,
}

struct InFlight<'a>(&'a MemoryObjectStore);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Object store held entirely in memory.
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    auth: Option<(RequestSigner, Arc<dyn CredentialProvider>)>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            auth: None,
        }
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Restricts the store to the given buckets; others are `BucketNotFound`.
    pub fn with_buckets(self, buckets: &[&str]) -> Self {
        self.inner.lock().unwrap().buckets = Some(buckets.iter().map(|b| b.to_string()).collect());
        self
    }

    /// Signs every call with credentials from `provider`, failing the call
    /// when signing fails.
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.auth = Some((RequestSigner::s3("us-east-1"), provider));
        self
    }

    /// Makes the next `times` calls of `op` fail with `kind`.
    pub fn inject_fault(&self, op: StoreOp, kind: FaultKind, times: usize) {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(kind, times));
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Part numbers stored so far, in arrival order.
    pub fn sent_parts(&self) -> Vec<u32> {
        self.inner.lock().unwrap().sent_parts.clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Multipart uploads initiated but neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }

    /// Contents of a stored object.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Seeds an object as if it had been uploaded with a single PUT.
    pub fn insert_object(&self, bucket: &str, key: &str, data: Vec<u8>) {
        let etag = format!("\"{}\"", md5_hex(&data));
        self.inner
            .lock()
            .unwrap()
            .objects
            .insert((bucket.to_string(), key.to_string()), StoredObject { data, etag });
    }

    /// Counts the call, authorizes it and applies latency or an injected fault.
    async fn begin(&self, op: StoreOp, bucket: &str, key: &str) -> Result<InFlight<'_>, TransferError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(self);

        let fault = {
            let mut inner = self.inner.lock().unwrap();
            *inner.calls.entry(op).or_default() += 1;
            let known = inner.buckets.as_ref().is_none_or(|b| b.contains(bucket));
            if !known {
                return Err(TransferError::BucketNotFound(bucket.to_string()));
            }
            inner.faults.get_mut(&op).and_then(VecDeque::pop_front)
        };

        if let Some((signer, provider)) = &self.auth {
            let request = SignableRequest::new("PUT", "memory.local", format!("/{bucket}/{key}"));
            signer.presign(provider.credentials().as_ref(), &request, Duration::from_secs(300))?;
        }

        trace!(?op, bucket, key, ?fault, "memory store call");
        if fault == Some(FaultKind::Hang) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        } else if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match fault {
            Some(kind) => Err(kind.into_error()),
            None => Ok(guard),
        }
    }
}

fn verify_checksum(body: &[u8], checksum: Option<&str>) -> Result<(), TransferError> {
    match checksum {
        Some(expected) if expected != sha256_base64(body) => Err(TransferError::ChecksumMismatch(
            "x-amz-checksum-sha256 does not match body".into(),
        )),
        _ => Ok(()),
    }
}

impl ObjectStore for MemoryObjectStore {
    fn head_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> StoreFuture<'a, Option<ObjectMeta>> {
        Box::pin(async move {
            let _guard = self.begin(StoreOp::Head, bucket, key).await?;
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .objects
                .get(&(bucket.to_string(), key.to_string()))
                .map(|o| ObjectMeta {
                    size: o.data.len() as u64,
                    etag: Some(o.etag.clone()),
                }))
        })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        body: Vec<u8>,
        checksum: Option<String>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let _guard = self.begin(StoreOp::Put, bucket, key).await?;
            verify_checksum(&body, checksum.as_deref())?;
            let etag = format!("\"{}\"", md5_hex(&body));
            self.inner.lock().unwrap().objects.insert(
                (bucket.to_string(), key.to_string()),
                StoredObject {
                    data: body,
                    etag: etag.clone(),
                },
            );
            Ok(etag)
        })
    }

    fn create_multipart<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let _guard = self.begin(StoreOp::CreateMultipart, bucket, key).await?;
            let mut inner = self.inner.lock().unwrap();
            inner.next_upload += 1;
            let upload_id = format!("mem-upload-{}", inner.next_upload);
            inner.uploads.insert(
                upload_id.clone(),
                PendingUpload {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        })
    }

    fn upload_part<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
        checksum: Option<String>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let _guard = self.begin(StoreOp::UploadPart, bucket, key).await?;
            verify_checksum(&body, checksum.as_deref())?;
            let mut inner = self.inner.lock().unwrap();
            let upload = inner
                .uploads
                .get_mut(upload_id)
                .filter(|u| u.bucket == bucket && u.key == key)
                .ok_or_else(|| TransferError::NoSuchUpload(upload_id.to_string()))?;
            let etag = format!("\"{}\"", md5_hex(&body));
            upload.parts.insert(part_number, (etag.clone(), body));
            inner.sent_parts.push(part_number);
            Ok(etag)
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let _guard = self.begin(StoreOp::CompleteMultipart, bucket, key).await?;
            let mut inner = self.inner.lock().unwrap();
            let upload = inner
                .uploads
                .get(upload_id)
                .filter(|u| u.bucket == bucket && u.key == key)
                .ok_or_else(|| TransferError::NoSuchUpload(upload_id.to_string()))?;

            if parts.is_empty() {
                return Err(TransferError::MultipartUploadFailed("no parts listed".into()));
            }
            if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
                return Err(TransferError::MultipartUploadFailed("InvalidPartOrder".into()));
            }

            let mut data = Vec::new();
            let mut digests = Vec::new();
            for (i, listed) in parts.iter().enumerate() {
                let (etag, body) = upload
                    .parts
                    .get(&listed.part_number)
                    .filter(|(etag, _)| *etag == listed.etag)
                    .ok_or_else(|| {
                        TransferError::MultipartUploadFailed(format!(
                            "InvalidPart: {}",
                            listed.part_number
                        ))
                    })?;
                let is_last = i + 1 == parts.len();
                if !is_last && (body.len() as u64) < MIN_PART_SIZE {
                    return Err(TransferError::MultipartUploadFailed(format!(
                        "EntityTooSmall: part {}",
                        listed.part_number
                    )));
                }
                digests.extend_from_slice(&hex::decode(etag.trim_matches('"')).unwrap_or_default());
                data.extend_from_slice(body);
            }

            let etag = format!("\"{}-{}\"", hex::encode(Md5::digest(&digests)), parts.len());
            inner.uploads.remove(upload_id);
            inner.objects.insert(
                (bucket.to_string(), key.to_string()),
                StoredObject {
                    data,
                    etag: etag.clone(),
                },
            );
            Ok(etag)
        })
    }

    fn abort_multipart<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.begin(StoreOp::AbortMultipart, bucket, key).await?;
            self.inner.lock().unwrap().uploads.remove(upload_id);
            Ok(())
        })
    }
}
