use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uplift_protocol::{CompletedPart, JobId, MultipartState};
use uplift_throttle::BandwidthThrottler;

use crate::chunked::{PartReader, sha256_base64};
use crate::resume::ResumeStore;
use crate::store::{ObjectStore, StoreFuture};
use crate::types::{PartPlan, PartRange, TransferRequest};
use crate::validation::validate_object_key;
use crate::{
    DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE, MAX_OBJECT_SIZE, MAX_SINGLE_PUT_SIZE,
    TransferError,
};

/// Tunables of [`TransferClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Files at or above this size use multipart upload. Capped at
    /// [`MAX_SINGLE_PUT_SIZE`].
    pub multipart_threshold: u64,
    /// Preferred part size; raised to the protocol minimum when smaller.
    pub part_size: u64,
    /// Parts of one job sent concurrently.
    pub part_concurrency: usize,
    /// Deadline for every store call.
    pub request_timeout: Duration,
    /// Attach a SHA-256 checksum to every body.
    pub part_checksums: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            part_concurrency: 4,
            request_timeout: Duration::from_secs(120),
            part_checksums: false,
        }
    }
}

impl TransferOptions {
    pub fn with_multipart_threshold(mut self, bytes: u64) -> Self {
        self.multipart_threshold = bytes.min(MAX_SINGLE_PUT_SIZE);
        self
    }

    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes;
        self
    }

    pub fn with_part_concurrency(mut self, n: usize) -> Self {
        self.part_concurrency = n.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_part_checksums(mut self, enabled: bool) -> Self {
        self.part_checksums = enabled;
        self
    }
}

/// Cancellation and pause signals observed between byte ranges.
#[derive(Debug, Clone)]
pub struct TransferSignals {
    pub cancel: CancellationToken,
    pub pause: watch::Receiver<bool>,
}

impl TransferSignals {
    pub fn new(cancel: CancellationToken, pause: watch::Receiver<bool>) -> Self {
        Self { cancel, pause }
    }

    /// Signals that never fire.
    pub fn detached() -> Self {
        let (_tx, pause) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause,
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// `Cancelled` wins over `Paused`.
    fn check(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            Err(TransferError::Cancelled)
        } else if self.is_paused() {
            Err(TransferError::Paused)
        } else {
            Ok(())
        }
    }
}

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Entity tag of the stored object.
    pub etag: String,
    pub multipart: bool,
    /// Bodies sent by this call (parts, or 1 for a single PUT).
    pub parts_sent: u32,
}

/// Uploads objects through an [`ObjectStore`].
pub struct TransferClient {
    store: Arc<dyn ObjectStore>,
    throttle: Arc<BandwidthThrottler>,
    options: TransferOptions,
    resume: Option<Arc<ResumeStore>>,
}

impl TransferClient {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        throttle: Arc<BandwidthThrottler>,
        options: TransferOptions,
    ) -> Self {
        Self {
            store,
            throttle,
            options,
            resume: None,
        }
    }

    /// Persists multipart state to `resume` after every acknowledged part.
    pub fn with_resume_store(mut self, resume: Arc<ResumeStore>) -> Self {
        self.resume = Some(resume);
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// The throttler shared by every upload of this client.
    pub fn throttle(&self) -> &Arc<BandwidthThrottler> {
        &self.throttle
    }

    pub fn resume_store(&self) -> Option<&Arc<ResumeStore>> {
        self.resume.as_ref()
    }

    /// Returns `true` if `size` bytes go through multipart upload.
    pub fn uses_multipart(&self, size: u64) -> bool {
        size >= self.options.multipart_threshold.min(MAX_SINGLE_PUT_SIZE)
    }

    /// Uploads `request`, resuming from `state`.
    ///
    /// `state` is updated in place as parts are acknowledged, so on any
    /// error it still describes what the store holds. `on_progress` receives
    /// the acknowledged byte count. Cancellation and pause are observed before
    /// each body is dispatched and during throttle waits; calls already in
    /// flight are allowed to finish.
    pub async fn upload(
        &self,
        request: &TransferRequest,
        state: &mut MultipartState,
        on_progress: &mut (dyn FnMut(u64) + Send),
        signals: &TransferSignals,
    ) -> Result<UploadReport, TransferError> {
        validate_object_key(&request.key)?;
        if request.size > MAX_OBJECT_SIZE {
            return Err(TransferError::FileTooLarge(request.size));
        }
        signals.check()?;
        let reader = PartReader::open(&request.source, request.size).await?;

        if state.is_started() || self.uses_multipart(request.size) {
            self.upload_multipart(request, &reader, state, on_progress, signals)
                .await
        } else {
            self.upload_single(request, &reader, on_progress, signals)
                .await
        }
    }

    /// Aborts the multipart upload behind `state` and forgets it.
    pub async fn abort(
        &self,
        request: &TransferRequest,
        state: &mut MultipartState,
    ) -> Result<(), TransferError> {
        if let Some(upload_id) = state.upload_id.clone() {
            self.timed(
                self.store
                    .abort_multipart(&request.bucket, &request.key, &upload_id),
            )
            .await?;
            info!(job = %request.job_id, upload_id = %upload_id, "multipart upload aborted");
        }
        state.clear();
        self.forget(request.job_id);
        Ok(())
    }

    async fn upload_single(
        &self,
        request: &TransferRequest,
        reader: &PartReader,
        on_progress: &mut (dyn FnMut(u64) + Send),
        signals: &TransferSignals,
    ) -> Result<UploadReport, TransferError> {
        let body = reader.read_all().await?;
        self.throttle
            .wait_for_bytes(request.size, &signals.cancel)
            .await
            .map_err(|_| TransferError::Cancelled)?;
        let checksum = self.options.part_checksums.then(|| sha256_base64(&body));

        let etag = self
            .timed(
                self.store
                    .put_object(&request.bucket, &request.key, body, checksum),
            )
            .await?;
        on_progress(request.size);
        debug!(job = %request.job_id, bytes = request.size, "single PUT stored");
        Ok(UploadReport {
            etag,
            multipart: false,
            parts_sent: 1,
        })
    }

    async fn upload_multipart(
        &self,
        request: &TransferRequest,
        reader: &PartReader,
        state: &mut MultipartState,
        on_progress: &mut (dyn FnMut(u64) + Send),
        signals: &TransferSignals,
    ) -> Result<UploadReport, TransferError> {
        let plan = PartPlan::new(request.size, self.options.part_size)?;

        if state.is_started() && !plan.accepts(state.completed_parts()) {
            warn!(
                job = %request.job_id,
                parts = state.completed_parts().len(),
                "recorded parts do not fit the part plan, restarting multipart upload"
            );
            if let Err(e) = self.abort(request, state).await {
                warn!(job = %request.job_id, error = %e, "abort of stale upload failed");
                state.clear();
                self.forget(request.job_id);
            }
        }

        if !state.is_started() {
            signals.check()?;
            let upload_id = self
                .timed(self.store.create_multipart(&request.bucket, &request.key))
                .await?;
            info!(
                job = %request.job_id,
                upload_id = %upload_id,
                parts = plan.count(),
                part_size = plan.part_size(),
                "multipart upload initiated"
            );
            *state = MultipartState::with_upload_id(upload_id);
            self.persist(request, state);
        }
        let Some(upload_id) = state.upload_id.clone() else {
            return Err(TransferError::MultipartUploadFailed("missing upload id".into()));
        };
        on_progress(state.completed_bytes());

        let mut pending: VecDeque<PartRange> = plan
            .parts()
            .filter(|p| !state.has_part(p.part_number))
            .collect();
        let mut in_flight = FuturesUnordered::new();
        let mut first_error: Option<TransferError> = None;
        let mut stopped: Option<TransferError> = None;
        let mut parts_sent = 0;

        loop {
            while first_error.is_none()
                && stopped.is_none()
                && in_flight.len() < self.options.part_concurrency.max(1)
            {
                let Some(part) = pending.pop_front() else {
                    break;
                };
                if let Err(signal) = signals.check() {
                    pending.push_front(part);
                    stopped = Some(signal);
                    break;
                }
                in_flight.push(self.send_part(request, reader, &upload_id, part, &signals.cancel));
            }

            let Some(result) = in_flight.next().await else {
                break;
            };
            match result {
                Ok(part) => {
                    let number = part.part_number;
                    state
                        .insert_part(part)
                        .map_err(|e| TransferError::InvalidResponse(e.to_string()))?;
                    parts_sent += 1;
                    self.persist(request, state);
                    on_progress(state.completed_bytes());
                    debug!(
                        job = %request.job_id,
                        part = number,
                        done = state.completed_parts().len(),
                        total = plan.count(),
                        "part stored"
                    );
                }
                Err(e) if first_error.is_none() => {
                    if !e.is_control() {
                        warn!(job = %request.job_id, error = %e, "part upload failed");
                    }
                    first_error = Some(e);
                }
                Err(e) => debug!(job = %request.job_id, error = %e, "additional part failure"),
            }
        }

        if signals.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if let Some(e) = first_error {
            if matches!(e, TransferError::NoSuchUpload(_)) {
                state.clear();
                self.forget(request.job_id);
            }
            return Err(e);
        }
        if let Some(signal) = stopped {
            return Err(signal);
        }
        if state.completed_parts().len() != plan.count() as usize {
            return Err(TransferError::MultipartUploadFailed(format!(
                "{} of {} parts stored",
                state.completed_parts().len(),
                plan.count()
            )));
        }

        signals.check()?;
        let completed = self
            .timed(self.store.complete_multipart(
                &request.bucket,
                &request.key,
                &upload_id,
                state.completed_parts(),
            ))
            .await;
        let etag = match completed {
            Ok(etag) => etag,
            Err(e) => {
                if matches!(e, TransferError::NoSuchUpload(_)) {
                    state.clear();
                    self.forget(request.job_id);
                }
                return Err(e);
            }
        };

        self.forget(request.job_id);
        info!(
            job = %request.job_id,
            parts = plan.count(),
            etag = %etag,
            "multipart upload completed"
        );
        Ok(UploadReport {
            etag,
            multipart: true,
            parts_sent,
        })
    }

    async fn send_part(
        &self,
        request: &TransferRequest,
        reader: &PartReader,
        upload_id: &str,
        part: PartRange,
        cancel: &CancellationToken,
    ) -> Result<CompletedPart, TransferError> {
        let body = reader.read_part(&part).await?;
        self.throttle
            .wait_for_bytes(part.len, cancel)
            .await
            .map_err(|_| TransferError::Cancelled)?;
        let checksum = self.options.part_checksums.then(|| sha256_base64(&body));
        let etag = self
            .timed(self.store.upload_part(
                &request.bucket,
                &request.key,
                upload_id,
                part.part_number,
                body,
                checksum,
            ))
            .await?;
        Ok(CompletedPart {
            part_number: part.part_number,
            etag,
            size: part.len,
        })
    }

    async fn timed<T>(&self, call: StoreFuture<'_, T>) -> Result<T, TransferError> {
        match tokio::time::timeout(self.options.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(self.options.request_timeout)),
        }
    }

    fn persist(&self, request: &TransferRequest, state: &MultipartState) {
        if let Some(resume) = &self.resume {
            if let Err(e) = resume.save(request, state) {
                warn!(job = %request.job_id, error = %e, "failed to persist multipart state");
            }
        }
    }

    fn forget(&self, job_id: JobId) {
        if let Some(resume) = &self.resume {
            if let Err(e) = resume.remove(job_id) {
                warn!(job = %job_id, error = %e, "failed to drop multipart state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::memory::{FaultKind, MemoryObjectStore, StoreOp};
    use crate::MIN_PART_SIZE;

    const PART: u64 = MIN_PART_SIZE;

    fn write_file(dir: &Path, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.join(name);
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    fn request(path: &Path, size: u64) -> TransferRequest {
        TransferRequest {
            job_id: JobId::new(),
            source: path.to_path_buf(),
            bucket: "media".into(),
            key: "clips/a.mov".into(),
            size,
        }
    }

    fn multipart_options() -> TransferOptions {
        TransferOptions::default()
            .with_multipart_threshold(PART)
            .with_part_size(PART)
            .with_part_concurrency(2)
    }

    fn client(store: &Arc<MemoryObjectStore>, options: TransferOptions) -> TransferClient {
        TransferClient::new(
            store.clone() as Arc<dyn ObjectStore>,
            Arc::new(BandwidthThrottler::unlimited()),
            options,
        )
    }

    #[tokio::test]
    async fn small_file_uses_single_put() {
        let dir = TempDir::new().unwrap();
        let (path, data) = write_file(dir.path(), "a.mov", 1_000);
        let store = Arc::new(MemoryObjectStore::new());
        let client = client(&store, TransferOptions::default().with_part_checksums(true));

        let mut state = MultipartState::default();
        let mut seen = Vec::new();
        let report = client
            .upload(
                &request(&path, 1_000),
                &mut state,
                &mut |b| seen.push(b),
                &TransferSignals::detached(),
            )
            .await
            .unwrap();

        assert!(!report.multipart);
        assert_eq!(seen, vec![1_000]);
        assert_eq!(store.object("media", "clips/a.mov").unwrap(), data);
        assert_eq!(store.calls(StoreOp::CreateMultipart), 0);
        assert!(!state.is_started());
    }

    #[test]
    fn single_put_size_is_capped() {
        let store = Arc::new(MemoryObjectStore::new());
        let options = TransferOptions::default().with_multipart_threshold(u64::MAX);
        assert_eq!(options.multipart_threshold, MAX_SINGLE_PUT_SIZE);

        let raised = client(&store, options);
        assert!(!raised.uses_multipart(MAX_SINGLE_PUT_SIZE - 1));
        assert!(raised.uses_multipart(MAX_SINGLE_PUT_SIZE));

        let unclamped = client(
            &store,
            TransferOptions {
                multipart_threshold: u64::MAX,
                ..TransferOptions::default()
            },
        );
        assert!(unclamped.uses_multipart(MAX_SINGLE_PUT_SIZE));
        assert!(!unclamped.uses_multipart(DEFAULT_MULTIPART_THRESHOLD - 1));
    }

    #[tokio::test]
    async fn large_file_uses_multipart() {
        let dir = TempDir::new().unwrap();
        let len = (2 * PART + 1234) as usize;
        let (path, data) = write_file(dir.path(), "a.mov", len);
        let store = Arc::new(MemoryObjectStore::new());
        let resume = Arc::new(ResumeStore::in_memory());
        let client = client(&store, multipart_options().with_part_checksums(true))
            .with_resume_store(resume.clone());

        let req = request(&path, len as u64);
        let mut state = MultipartState::default();
        let mut last = 0;
        let report = client
            .upload(&req, &mut state, &mut |b| last = b, &TransferSignals::detached())
            .await
            .unwrap();

        assert!(report.multipart);
        assert_eq!(report.parts_sent, 3);
        assert!(report.etag.ends_with("-3\""));
        assert_eq!(last, len as u64);
        assert_eq!(store.object("media", "clips/a.mov").unwrap(), data);
        assert_eq!(state.completed_parts().len(), 3);
        assert!(resume.get(req.job_id).is_none());
        assert!(store.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn resume_skips_acknowledged_parts() {
        let dir = TempDir::new().unwrap();
        let len = (2 * PART + 10) as usize;
        let (path, data) = write_file(dir.path(), "a.mov", len);
        let store = Arc::new(MemoryObjectStore::new());

        // Part 1 went through in an earlier attempt.
        let upload_id = store.create_multipart("media", "clips/a.mov").await.unwrap();
        let etag = store
            .upload_part("media", "clips/a.mov", &upload_id, 1, data[..PART as usize].to_vec(), None)
            .await
            .unwrap();
        let mut state = MultipartState::with_upload_id(upload_id);
        state
            .insert_part(CompletedPart {
                part_number: 1,
                etag,
                size: PART,
            })
            .unwrap();

        let client = client(&store, multipart_options());
        let report = client
            .upload(&request(&path, len as u64), &mut state, &mut |_| {}, &TransferSignals::detached())
            .await
            .unwrap();

        assert_eq!(report.parts_sent, 2);
        assert_eq!(store.sent_parts().iter().filter(|&&n| n == 1).count(), 1);
        assert_eq!(store.calls(StoreOp::CreateMultipart), 1);
        assert_eq!(store.object("media", "clips/a.mov").unwrap(), data);
    }

    #[tokio::test]
    async fn failed_part_leaves_state_resumable() {
        let dir = TempDir::new().unwrap();
        let len = (PART + 10) as usize;
        let (path, _) = write_file(dir.path(), "a.mov", len);
        let store = Arc::new(MemoryObjectStore::new());
        store.inject_fault(StoreOp::UploadPart, FaultKind::Network, 1);
        let resume = Arc::new(ResumeStore::in_memory());
        let client = client(&store, multipart_options().with_part_concurrency(1))
            .with_resume_store(resume.clone());
        let req = request(&path, len as u64);

        let mut state = MultipartState::default();
        let err = client
            .upload(&req, &mut state, &mut |_| {}, &TransferSignals::detached())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(state.is_started());
        assert_eq!(resume.get(req.job_id).unwrap().upload_id, state.upload_id.clone().unwrap());

        client
            .upload(&req, &mut state, &mut |_| {}, &TransferSignals::detached())
            .await
            .unwrap();
        assert_eq!(store.calls(StoreOp::CreateMultipart), 1);
        assert!(resume.get(req.job_id).is_none());
    }

    #[tokio::test]
    async fn stale_parts_restart_the_upload() {
        let dir = TempDir::new().unwrap();
        let len = (PART + 10) as usize;
        let (path, _) = write_file(dir.path(), "a.mov", len);
        let store = Arc::new(MemoryObjectStore::new());
        let old_id = store.create_multipart("media", "clips/a.mov").await.unwrap();
        let mut state = MultipartState::with_upload_id(old_id);
        state
            .insert_part(CompletedPart {
                part_number: 1,
                etag: "\"x\"".into(),
                size: 123,
            })
            .unwrap();

        let client = client(&store, multipart_options());
        client
            .upload(&request(&path, len as u64), &mut state, &mut |_| {}, &TransferSignals::detached())
            .await
            .unwrap();

        assert_eq!(store.calls(StoreOp::AbortMultipart), 1);
        assert_eq!(store.calls(StoreOp::CreateMultipart), 2);
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn vanished_upload_clears_state() {
        let dir = TempDir::new().unwrap();
        let len = (PART + 10) as usize;
        let (path, _) = write_file(dir.path(), "a.mov", len);
        let store = Arc::new(MemoryObjectStore::new());
        let client = client(&store, multipart_options());

        let mut state = MultipartState::with_upload_id("expired-upload");
        let err = client
            .upload(&request(&path, len as u64), &mut state, &mut |_| {}, &TransferSignals::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NoSuchUpload(_)));
        assert!(err.is_retryable());
        assert!(!state.is_started());
    }

    #[tokio::test]
    async fn hung_call_times_out() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(dir.path(), "a.mov", 10);
        let store = Arc::new(MemoryObjectStore::new());
        store.inject_fault(StoreOp::Put, FaultKind::Hang, 1);
        let client = client(
            &store,
            TransferOptions::default().with_request_timeout(Duration::from_millis(50)),
        );

        let err = client
            .upload(&request(&path, 10), &mut MultipartState::default(), &mut |_| {}, &TransferSignals::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));
    }

    #[tokio::test]
    async fn paused_and_cancelled_send_nothing() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(dir.path(), "a.mov", 10);
        let store = Arc::new(MemoryObjectStore::new());
        let client = client(&store, TransferOptions::default());

        let (_pause_tx, pause_rx) = watch::channel(true);
        let paused = TransferSignals::new(CancellationToken::new(), pause_rx);
        let err = client
            .upload(&request(&path, 10), &mut MultipartState::default(), &mut |_| {}, &paused)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Paused));

        let cancelled = TransferSignals::detached();
        cancelled.cancel.cancel();
        let err = client
            .upload(&request(&path, 10), &mut MultipartState::default(), &mut |_| {}, &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(store.calls(StoreOp::Put), 0);
    }

    #[tokio::test]
    async fn abort_releases_upload() {
        let store = Arc::new(MemoryObjectStore::new());
        let client = client(&store, TransferOptions::default());
        let upload_id = store.create_multipart("media", "clips/a.mov").await.unwrap();
        let mut state = MultipartState::with_upload_id(upload_id);

        client
            .abort(&request(Path::new("/unused"), 1), &mut state)
            .await
            .unwrap();
        assert_eq!(store.open_uploads(), 0);
        assert!(!state.is_started());
    }

    #[tokio::test]
    async fn long_key_is_rejected_before_io() {
        let store = Arc::new(MemoryObjectStore::new());
        let client = client(&store, TransferOptions::default());
        let mut req = request(Path::new("/does/not/exist"), 1);
        req.key = "k".repeat(2_000);
        let err = client
            .upload(&req, &mut MultipartState::default(), &mut |_| {}, &TransferSignals::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::KeyTooLong(2_000)));
    }
}
