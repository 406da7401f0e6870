//! End-to-end scheduler scenarios against the in-memory store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use uplift_dedup::{DetectorOptions, DuplicateDetector, DuplicateType};
use uplift_manager::{
    EnqueueError, HistoryStore, JobRequest, ManagerConfig, RetryPolicy, UploadEvent, UploadManager,
};
use uplift_protocol::{
    CompletedPart, DuplicateAction, JobId, JobOutcome, JobStatus, MultipartState, UploadJob,
};
use uplift_throttle::BandwidthThrottler;
use uplift_transfer::{
    FaultKind, MIN_PART_SIZE, MemoryObjectStore, ObjectStore, ResumeStore, StoreOp,
    TransferClient, TransferOptions, TransferRequest,
};

const PART: u64 = MIN_PART_SIZE;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

fn multipart_options() -> TransferOptions {
    TransferOptions::default()
        .with_multipart_threshold(PART)
        .with_part_size(PART)
        .with_part_concurrency(1)
}

fn build(
    store: &Arc<MemoryObjectStore>,
    config: ManagerConfig,
    options: TransferOptions,
    resume: Option<Arc<ResumeStore>>,
) -> UploadManager {
    let store = store.clone() as Arc<dyn ObjectStore>;
    let mut client = TransferClient::new(
        store.clone(),
        Arc::new(BandwidthThrottler::unlimited()),
        options,
    );
    if let Some(resume) = resume {
        client = client.with_resume_store(resume);
    }
    let detector = DuplicateDetector::new(Some(store), DetectorOptions::default());
    UploadManager::new(config, client, detector, HistoryStore::in_memory(100), None)
}

fn write_file(dir: &Path, name: &str, len: usize, seed: u8) -> PathBuf {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8 ^ seed).collect();
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

async fn settle(manager: &UploadManager) {
    tokio::time::timeout(Duration::from_secs(20), manager.wait_for_idle())
        .await
        .expect("manager never went idle");
}

fn job(manager: &UploadManager, id: JobId) -> UploadJob {
    manager.get_job(id).expect("job is known")
}

#[tokio::test]
async fn concurrency_limit_is_never_exceeded() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new().with_latency(Duration::from_millis(30)));
    let manager = build(
        &store,
        ManagerConfig::default().with_max_concurrent(3),
        TransferOptions::default(),
        None,
    );

    let peak = Arc::new(AtomicUsize::new(0));
    let mut status = manager.subscribe_status();
    let watcher_peak = peak.clone();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let active = status.borrow_and_update().active;
            watcher_peak.fetch_max(active, Ordering::SeqCst);
        }
    });

    let mut ids = Vec::new();
    for i in 0..10 {
        let path = write_file(dir.path(), &format!("take-{i}.wav"), 1_000 + i, i as u8);
        let request = JobRequest::new(path, "media", format!("takes/take-{i}.wav"));
        ids.push(manager.enqueue(request).unwrap());
    }
    manager.start();
    settle(&manager).await;

    for id in ids {
        assert_eq!(job(&manager, id).status, JobStatus::Completed);
    }
    assert!(store.max_in_flight() <= 3);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    let status = manager.get_status();
    assert_eq!(status.completed, 10);
    assert!((status.progress_percent - 100.0).abs() < f64::EPSILON);
    assert_eq!(manager.history(20).len(), 10);
}

#[tokio::test]
async fn timeouts_are_retried_until_success() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    store.inject_fault(StoreOp::Put, FaultKind::Timeout, 2);
    let manager = build(
        &store,
        ManagerConfig::default().with_retry(fast_retry(3)),
        TransferOptions::default(),
        None,
    );

    let path = write_file(dir.path(), "a.wav", 2_000, 1);
    let id = manager.enqueue(JobRequest::new(path, "media", "a.wav")).unwrap();
    manager.start();
    settle(&manager).await;

    let job = job(&manager, id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_attempts, 2);
    assert_eq!(job.retry_errors.len(), 2);
    assert!(job.last_error.is_none());
    assert_eq!(job.progress.bytes_uploaded, job.total_bytes);
    assert_eq!(store.calls(StoreOp::Put), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_and_explicit_retry_recovers() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    store.inject_fault(StoreOp::Put, FaultKind::Network, 5);
    let manager = build(
        &store,
        ManagerConfig::default().with_retry(fast_retry(3)),
        TransferOptions::default(),
        None,
    );

    let path = write_file(dir.path(), "a.wav", 2_000, 1);
    let id = manager.enqueue(JobRequest::new(path, "media", "a.wav")).unwrap();
    manager.start();
    settle(&manager).await;

    let failed = job(&manager, id);
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_attempts, 2);
    assert_eq!(failed.retry_errors.len(), 3);
    assert!(failed.last_error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(manager.history(1)[0].status, JobStatus::Failed);

    manager.retry(id).unwrap();
    settle(&manager).await;
    let recovered = job(&manager, id);
    assert_eq!(recovered.status, JobStatus::Completed);
    assert_eq!(store.calls(StoreOp::Put), 6);
    assert!(manager.retry(id).is_err());
}

#[tokio::test]
async fn non_retryable_errors_fail_immediately() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    store.inject_fault(StoreOp::Put, FaultKind::AccessDenied, 1);
    let manager = build(
        &store,
        ManagerConfig::default().with_retry(fast_retry(3)),
        TransferOptions::default(),
        None,
    );

    let path = write_file(dir.path(), "a.wav", 100, 1);
    let id = manager.enqueue(JobRequest::new(path, "media", "a.wav")).unwrap();
    manager.start();
    settle(&manager).await;

    let job = job(&manager, id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_attempts, 0);
    assert!(job.last_error.is_some());
    assert_eq!(store.calls(StoreOp::Put), 1);
}

#[tokio::test]
async fn cancel_during_upload_is_final() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new().with_latency(Duration::from_millis(200)));
    // The in-flight part fails after the cancel; it must not be retried.
    store.inject_fault(StoreOp::UploadPart, FaultKind::Network, 1);
    let manager = build(
        &store,
        ManagerConfig::default().with_retry(fast_retry(3)),
        multipart_options(),
        None,
    );

    let path = write_file(dir.path(), "a.mov", (2 * PART + 100) as usize, 3);
    let id = manager.enqueue(JobRequest::new(path, "media", "a.mov")).unwrap();
    manager.start();

    tokio::time::timeout(Duration::from_secs(10), async {
        while store.calls(StoreOp::UploadPart) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("upload never started");
    assert_eq!(job(&manager, id).status, JobStatus::Uploading);

    manager.cancel(id).await.unwrap();
    settle(&manager).await;

    let job = job(&manager, id);
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.retry_attempts, 0);
    assert!(!job.multipart.is_started());
    assert_eq!(store.calls(StoreOp::UploadPart), 1);
    assert_eq!(store.calls(StoreOp::AbortMultipart), 1);
    assert_eq!(store.open_uploads(), 0);

    // Idempotent once cancelled.
    manager.cancel(id).await.unwrap();
}

#[tokio::test]
async fn restart_resumes_without_resending_parts() {
    let dir = TempDir::new().unwrap();
    let len = (2 * PART + 100) as usize;
    let path = write_file(dir.path(), "a.mov", len, 5);
    let data = std::fs::read(&path).unwrap();
    let resume_path = dir.path().join("state/resume.json");
    let store = Arc::new(MemoryObjectStore::new());

    // A previous process stored part 1 and persisted its progress.
    {
        let resume = ResumeStore::open(resume_path.clone()).unwrap();
        let upload_id = store.create_multipart("media", "a.mov").await.unwrap();
        let etag = store
            .upload_part("media", "a.mov", &upload_id, 1, data[..PART as usize].to_vec(), None)
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
        let request = TransferRequest {
            job_id: JobId::new(),
            source: path.clone(),
            bucket: "media".into(),
            key: "a.mov".into(),
            size: len as u64,
        };
        resume.save(&request, &state).unwrap();
    }

    let resume = Arc::new(ResumeStore::open(resume_path).unwrap());
    let manager = build(&store, ManagerConfig::default(), multipart_options(), Some(resume.clone()));
    let id = manager.enqueue(JobRequest::new(path, "media", "a.mov")).unwrap();
    assert_eq!(job(&manager, id).progress.bytes_uploaded, PART);
    manager.start();
    settle(&manager).await;

    assert_eq!(job(&manager, id).status, JobStatus::Completed);
    assert_eq!(store.calls(StoreOp::UploadPart), 3);
    assert_eq!(store.sent_parts().iter().filter(|&&n| n == 1).count(), 1);
    assert_eq!(store.calls(StoreOp::CreateMultipart), 1);
    assert_eq!(store.object("media", "a.mov").unwrap(), data);
    assert!(resume.records().is_empty());
}

#[tokio::test]
async fn resumed_upload_counts_as_recent_for_later_copies() {
    let dir = TempDir::new().unwrap();
    let len = (2 * PART + 100) as usize;
    let path = write_file(dir.path(), "a.mov", len, 6);
    let data = std::fs::read(&path).unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let resume = Arc::new(ResumeStore::in_memory());

    let upload_id = store.create_multipart("media", "a.mov").await.unwrap();
    let etag = store
        .upload_part("media", "a.mov", &upload_id, 1, data[..PART as usize].to_vec(), None)
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
    let request = TransferRequest {
        job_id: JobId::new(),
        source: path.clone(),
        bucket: "media".into(),
        key: "a.mov".into(),
        size: len as u64,
    };
    resume.save(&request, &state).unwrap();

    let manager = build(
        &store,
        ManagerConfig::default().with_duplicate_action(DuplicateAction::Skip),
        multipart_options(),
        Some(resume),
    );
    let first = manager.enqueue(JobRequest::new(path.clone(), "media", "a.mov")).unwrap();
    assert_eq!(job(&manager, first).progress.bytes_uploaded, PART);
    manager.start();
    settle(&manager).await;
    assert_eq!(job(&manager, first).outcome, Some(JobOutcome::Uploaded));
    assert_eq!(store.calls(StoreOp::CreateMultipart), 1);
    assert!(job(&manager, first).content_hash.is_some());
    let parts_sent = store.calls(StoreOp::UploadPart);

    let copy = dir.path().join("copy.mov");
    std::fs::copy(&path, &copy).unwrap();
    let second = manager.enqueue(JobRequest::new(copy, "media", "copy.mov")).unwrap();
    settle(&manager).await;

    assert_eq!(job(&manager, second).outcome, Some(JobOutcome::SkippedDuplicate));
    assert_eq!(store.calls(StoreOp::UploadPart), parts_sent);
}

#[tokio::test]
async fn same_content_twice_is_recent_duplicate() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let manager = build(
        &store,
        ManagerConfig::default().with_duplicate_action(DuplicateAction::Skip),
        TransferOptions::default(),
        None,
    );
    let mut events = manager.take_events().unwrap();
    assert!(manager.take_events().is_none());
    manager.start();

    let first = write_file(dir.path(), "a.wav", 4_000, 9);
    let second = dir.path().join("copy.wav");
    std::fs::copy(&first, &second).unwrap();

    manager.enqueue(JobRequest::new(first, "media", "a.wav")).unwrap();
    settle(&manager).await;
    let id = manager.enqueue(JobRequest::new(second, "media", "copy.wav")).unwrap();
    settle(&manager).await;

    let skipped = job(&manager, id);
    assert_eq!(skipped.status, JobStatus::Completed);
    assert_eq!(skipped.outcome, Some(JobOutcome::SkippedDuplicate));
    assert_eq!(skipped.progress.bytes_uploaded, skipped.total_bytes);
    assert_eq!(store.calls(StoreOp::Put), 1);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let UploadEvent::DuplicateDetected { id: dup, check } = event {
            assert_eq!(dup, id);
            assert!(check.is_duplicate);
            kinds.push(check.duplicate_type);
        }
    }
    assert_eq!(kinds, vec![DuplicateType::RecentlyUploaded]);
}

#[tokio::test]
async fn rename_policy_picks_free_key() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    store.insert_object("media", "clips/a.wav", b"older take".to_vec());
    let manager = build(
        &store,
        ManagerConfig::default().with_duplicate_action(DuplicateAction::Rename),
        TransferOptions::default(),
        None,
    );

    let path = write_file(dir.path(), "a.wav", 500, 2);
    let id = manager.enqueue(JobRequest::new(path, "media", "clips/a.wav")).unwrap();
    manager.start();
    settle(&manager).await;

    let job = job(&manager, id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.key, "clips/a-1.wav");
    assert_eq!(store.object("media", "clips/a.wav").unwrap(), b"older take");
    assert!(store.object("media", "clips/a-1.wav").is_some());
}

#[tokio::test]
async fn paused_manager_dispatches_nothing_until_resumed() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let manager = build(&store, ManagerConfig::default(), TransferOptions::default(), None);

    manager.pause();
    manager.pause();
    let path = write_file(dir.path(), "a.wav", 100, 1);
    let id = manager.enqueue(JobRequest::new(path, "media", "a.wav")).unwrap();
    manager.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = manager.get_status();
    assert_eq!(status.pending, 1);
    assert!(status.is_paused);
    assert!(!status.is_running);
    assert_eq!(store.calls(StoreOp::Put), 0);

    manager.resume();
    settle(&manager).await;
    assert_eq!(job(&manager, id).status, JobStatus::Completed);
    assert!(!manager.get_status().is_paused);
}

#[tokio::test]
async fn cancel_all_cancels_queued_jobs() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let manager = build(&store, ManagerConfig::default(), TransferOptions::default(), None);

    let a = write_file(dir.path(), "a.wav", 100, 1);
    let b = write_file(dir.path(), "b.wav", 100, 2);
    let a = manager.enqueue(JobRequest::new(a, "media", "a.wav")).unwrap();
    let b = manager.enqueue(JobRequest::new(b, "media", "b.wav")).unwrap();
    assert_eq!(manager.cancel_all().await, 2);
    manager.start();
    settle(&manager).await;

    assert_eq!(job(&manager, a).status, JobStatus::Cancelled);
    assert_eq!(job(&manager, b).status, JobStatus::Cancelled);
    assert_eq!(store.calls(StoreOp::Put), 0);
    assert_eq!(manager.get_status().cancelled, 2);
    assert!(manager.cancel(JobId::new()).await.is_err());
}

#[tokio::test]
async fn enqueue_rejects_invalid_jobs() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let manager = build(&store, ManagerConfig::default(), TransferOptions::default(), None);
    let path = write_file(dir.path(), "a.wav", 10, 1);

    assert!(matches!(
        manager.enqueue(JobRequest::new(dir.path().join("missing.wav"), "media", "a.wav")),
        Err(EnqueueError::SourceUnreadable { .. })
    ));
    assert!(matches!(
        manager.enqueue(JobRequest::new(&path, "", "a.wav")),
        Err(EnqueueError::EmptyBucket)
    ));
    assert!(matches!(
        manager.enqueue(JobRequest::new(&path, "media", "")),
        Err(EnqueueError::EmptyKey)
    ));
    assert!(matches!(
        manager.enqueue(JobRequest::new(&path, "media", "k".repeat(1_025))),
        Err(EnqueueError::KeyTooLong(1_025))
    ));
    assert!(matches!(
        manager.enqueue(JobRequest::new(&path, "Media_Bucket", "a.wav")),
        Err(EnqueueError::InvalidBucket(_))
    ));
    assert!(manager.list_jobs().is_empty());
}
