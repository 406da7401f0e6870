//! Upload scheduler.
//!
//! Jobs wait in a FIFO queue until one of `max_concurrent` slots frees up.
//! Each dispatched job runs in its own task which exclusively owns the job
//! until it settles; the shared table only holds snapshots published by that
//! task. Retries are re-enqueued with a due time instead of sleeping inside
//! a slot.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uplift_dedup::DuplicateDetector;
use uplift_protocol::{
    HistoryRecord, JobId, JobStatus, JobSummary, StatusSummary, UploadJob,
};
use uplift_signer::CredentialProvider;
use uplift_transfer::{
    TransferClient, TransferError, TransferRequest, validate_bucket_name, validate_object_key,
    validate_source,
};

use crate::error::{EnqueueError, ManagerError};
use crate::history::HistoryStore;
use crate::types::{JobRequest, ManagerConfig, UploadEvent};
use crate::worker;

/// Queue, slot and retry bookkeeping. Guarded by `Shared::state`.
#[derive(Default)]
pub(crate) struct SchedulerState {
    /// Latest snapshot of every known job.
    pub(crate) jobs: HashMap<JobId, UploadJob>,
    /// Enqueue sequence number of each job; keeps FIFO order across requeues.
    pub(crate) order: HashMap<JobId, u64>,
    /// Jobs ready to run, by sequence number.
    pub(crate) queue: BTreeMap<u64, JobId>,
    /// Scheduled retries, by due time.
    pub(crate) delayed: BTreeMap<(Instant, u64), JobId>,
    /// Jobs owned by a worker task.
    pub(crate) running: HashMap<JobId, CancellationToken>,
    /// Terminal jobs in archive order, for retention.
    pub(crate) finished: VecDeque<JobId>,
    next_seq: u64,
}

impl SchedulerState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Puts a pending job back in the ready queue at its original position.
    pub(crate) fn requeue(&mut self, id: JobId) {
        let seq = match self.order.get(&id) {
            Some(&seq) => seq,
            None => {
                let seq = self.next_seq();
                self.order.insert(id, seq);
                seq
            }
        };
        self.queue.insert(seq, id);
    }

    pub(crate) fn schedule_retry(&mut self, id: JobId, due: Instant) {
        let seq = self.order.get(&id).copied().unwrap_or_default();
        self.delayed.insert((due, seq), id);
    }

    /// Marks `id` finished and drops the oldest finished jobs beyond `retain`.
    pub(crate) fn archive(&mut self, id: JobId, retain: usize) {
        self.finished.push_back(id);
        while self.finished.len() > retain {
            let Some(old) = self.finished.pop_front() else {
                break;
            };
            if self.jobs.get(&old).is_some_and(UploadJob::is_terminal)
                && !self.finished.contains(&old)
            {
                self.jobs.remove(&old);
                self.order.remove(&old);
            }
        }
    }

    fn summarize(&self, paused: bool) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Preparing | JobStatus::Uploading => summary.active += 1,
                JobStatus::Paused => summary.paused += 1,
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
            }
            if job.status != JobStatus::Cancelled {
                summary.total_bytes += job.total_bytes;
                summary.uploaded_bytes += job.progress.bytes_uploaded;
            }
            if job.status == JobStatus::Uploading {
                summary.is_running = true;
            }
        }
        if summary.total_bytes > 0 {
            summary.progress_percent =
                summary.uploaded_bytes as f64 / summary.total_bytes as f64 * 100.0;
        }
        summary.is_paused = paused && !summary.is_running;
        summary
    }
}

/// State shared between the manager handle, the scheduler and workers.
pub(crate) struct Shared {
    pub(crate) config: ManagerConfig,
    pub(crate) client: TransferClient,
    pub(crate) detector: DuplicateDetector,
    pub(crate) history: HistoryStore,
    pub(crate) credentials: Option<Arc<dyn CredentialProvider>>,
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) wake: Notify,
    pub(crate) pause_tx: watch::Sender<bool>,
    pub(crate) shutdown: CancellationToken,
    status_tx: watch::Sender<StatusSummary>,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<UploadEvent>>>,
    events_dropping: AtomicBool,
    started: AtomicBool,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub(crate) fn publish_status(&self, state: &SchedulerState) {
        self.status_tx.send_replace(state.summarize(self.is_paused()));
    }

    /// Sends an event without ever blocking the caller.
    pub(crate) fn emit(&self, event: UploadEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => self.events_dropping.store(false, Ordering::Relaxed),
            Err(TrySendError::Full(_)) => {
                if !self.events_dropping.swap(true, Ordering::Relaxed) {
                    warn!("event channel full, dropping events");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Replaces the snapshot of `job` and republishes status.
    pub(crate) fn store_snapshot(&self, job: &UploadJob) {
        let mut state = self.lock();
        state.jobs.insert(job.id, job.clone());
        self.publish_status(&state);
    }

    pub(crate) fn record_progress(&self, id: JobId, bytes: u64, speed_bps: f64) {
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(&id) {
            job.set_bytes_uploaded(bytes);
            job.progress.speed_bps = speed_bps;
        }
        self.publish_status(&state);
    }

    /// Appends a finished job to the history sink.
    pub(crate) fn write_history(&self, job: &UploadJob) {
        if let Err(e) = self.history.append(HistoryRecord::from(job)) {
            warn!(job = %job.id, error = %e, "failed to write history record");
        }
    }

    /// Returns `true` if `err` may succeed on another attempt.
    ///
    /// Expired credentials count only once the provider hands out fresh ones.
    pub(crate) fn is_transient(&self, err: &TransferError) -> bool {
        if err.is_retryable() {
            return true;
        }
        err.is_expired_credentials()
            && self
                .credentials
                .as_ref()
                .and_then(|p| p.credentials())
                .is_some_and(|c| !c.is_expired())
    }

    /// Promotes due retries, fills free slots and returns the next retry
    /// due time.
    fn dispatch(self: &Arc<Self>) -> Option<Instant> {
        let mut spawn = Vec::new();
        let next_due = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let now = Instant::now();

            while state
                .delayed
                .first_key_value()
                .is_some_and(|(&(due, _), _)| due <= now)
            {
                if let Some(((_, seq), id)) = state.delayed.pop_first() {
                    if let Some(job) = state.jobs.get_mut(&id) {
                        job.next_attempt_at = None;
                    }
                    state.queue.insert(seq, id);
                }
            }

            if !self.is_paused() {
                while state.running.len() < self.config.max_concurrent.max(1) {
                    let Some((_, id)) = state.queue.pop_first() else {
                        break;
                    };
                    let Some(job) = state
                        .jobs
                        .get(&id)
                        .filter(|j| j.status == JobStatus::Pending)
                        .cloned()
                    else {
                        continue;
                    };
                    let cancel = self.shutdown.child_token();
                    state.running.insert(id, cancel.clone());
                    spawn.push((job, cancel));
                }
            }

            self.publish_status(state);
            state.delayed.first_key_value().map(|(&(due, _), _)| due)
        };

        for (job, cancel) in spawn {
            debug!(job = %job.id, "dispatching job");
            tokio::spawn(worker::run(self.clone(), job, cancel));
        }
        next_due
    }
}

async fn run_scheduler(shared: Arc<Shared>) {
    info!(
        max_concurrent = shared.config.max_concurrent,
        "upload scheduler started"
    );
    loop {
        let next_due = shared.dispatch();
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = sleep_until(next_due) => {}
        }
    }
    info!("upload scheduler stopped");
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Handle to the upload scheduler. Cheap to clone.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Shared>,
}

impl UploadManager {
    /// Creates a stopped manager; call [`start`](Self::start) to dispatch.
    ///
    /// `credentials` is consulted when deciding whether an expired-credential
    /// failure is worth retrying.
    pub fn new(
        config: ManagerConfig,
        client: TransferClient,
        detector: DuplicateDetector,
        history: HistoryStore,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (pause_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(StatusSummary::default());
        Self {
            inner: Arc::new(Shared {
                config,
                client,
                detector,
                history,
                credentials,
                state: Mutex::new(SchedulerState::default()),
                wake: Notify::new(),
                pause_tx,
                shutdown: CancellationToken::new(),
                status_tx,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                events_dropping: AtomicBool::new(false),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.inner.events_rx.lock().unwrap().take()
    }

    /// Validates `request` and queues it.
    ///
    /// A persisted multipart upload for the same source, size and
    /// destination is adopted so the job resumes where it left off.
    pub fn enqueue(&self, request: JobRequest) -> Result<JobId, EnqueueError> {
        if request.bucket.trim().is_empty() {
            return Err(EnqueueError::EmptyBucket);
        }
        if request.key.is_empty() {
            return Err(EnqueueError::EmptyKey);
        }
        let reject = |e| EnqueueError::from_transfer(&request.source, e);
        validate_bucket_name(&request.bucket).map_err(reject)?;
        validate_object_key(&request.key).map_err(reject)?;
        let size = validate_source(&request.source).map_err(reject)?;

        let mut job = UploadJob::new(request.source, request.bucket, request.key, size);
        if let Some(hash) = request.content_hash {
            job = job.with_content_hash(hash);
        }
        if let Some(resume) = self.inner.client.resume_store() {
            if let Some(state) = resume.adopt(job.id, &job.source, &job.bucket, &job.key, size) {
                job.multipart = state;
                job.set_bytes_uploaded(job.multipart.completed_bytes());
            }
        }

        let id = job.id;
        info!(
            job = %id,
            source = %job.source.display(),
            bucket = %job.bucket,
            key = %job.key,
            size,
            "job enqueued"
        );
        {
            let mut state = self.inner.lock();
            state.jobs.insert(id, job);
            state.requeue(id);
            self.inner.publish_status(&state);
        }
        self.inner.emit(UploadEvent::StatusChanged {
            id,
            status: JobStatus::Pending,
        });
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Starts the scheduler task. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(run_scheduler(self.inner.clone()));
    }

    /// Stops dispatching and interrupts running jobs, leaving them resumable.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Stops dispatching new byte ranges. Idempotent.
    ///
    /// Calls already in flight finish; their jobs park at `paused`.
    pub fn pause(&self) {
        let state = self.inner.lock();
        if self.inner.pause_tx.send_replace(true) {
            return;
        }
        info!("uploads paused");
        self.inner.publish_status(&state);
    }

    /// Requeues paused jobs and resumes dispatching. Idempotent.
    pub fn resume(&self) {
        let mut resumed = Vec::new();
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let was_paused = self.inner.pause_tx.send_replace(false);
            for job in state.jobs.values_mut() {
                if job.status == JobStatus::Paused
                    && !state.running.contains_key(&job.id)
                    && job.transition(JobStatus::Pending).is_ok()
                {
                    resumed.push(job.id);
                }
            }
            for id in &resumed {
                state.requeue(*id);
            }
            self.inner.publish_status(state);
            if was_paused {
                info!(requeued = resumed.len(), "uploads resumed");
            }
        }
        for id in resumed {
            self.inner.emit(UploadEvent::StatusChanged {
                id,
                status: JobStatus::Pending,
            });
        }
        self.inner.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    /// Cancels a job. Idempotent for jobs that already finished.
    ///
    /// A running job is signalled and settles at its next suspension point.
    /// A queued, delayed or paused job is cancelled here and its multipart
    /// upload, if any, is aborted.
    pub async fn cancel(&self, id: JobId) -> Result<(), ManagerError> {
        let job = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let status = state
                .jobs
                .get(&id)
                .map(|j| j.status)
                .ok_or(ManagerError::UnknownJob(id))?;
            if status.is_terminal() {
                return Ok(());
            }
            if let Some(token) = state.running.get(&id) {
                info!(job = %id, "cancelling running job");
                token.cancel();
                return Ok(());
            }

            state.queue.retain(|_, queued| *queued != id);
            state.delayed.retain(|_, queued| *queued != id);
            let Some(job) = state.jobs.get_mut(&id) else {
                return Err(ManagerError::UnknownJob(id));
            };
            if let Err(e) = job.transition(JobStatus::Cancelled) {
                warn!(job = %id, error = %e, "cannot cancel job");
                return Ok(());
            }
            let job = job.clone();
            state.archive(id, self.inner.config.retain_finished);
            self.inner.publish_status(state);
            job
        };

        if job.multipart.is_started() {
            let mut multipart = job.multipart.clone();
            let request = TransferRequest::from_job(&job);
            if let Err(e) = self.inner.client.abort(&request, &mut multipart).await {
                warn!(job = %id, error = %e, "failed to abort multipart upload");
            }
            if let Some(stored) = self.inner.lock().jobs.get_mut(&id) {
                stored.multipart = multipart;
            }
        }
        info!(job = %id, "job cancelled");
        self.inner.write_history(&job);
        self.inner.emit(UploadEvent::StatusChanged {
            id,
            status: JobStatus::Cancelled,
        });
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Cancels every job that has not finished. Returns how many were
    /// cancelled.
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<JobId> = {
            let state = self.inner.lock();
            state
                .jobs
                .values()
                .filter(|j| !j.is_terminal())
                .map(|j| j.id)
                .collect()
        };
        let mut cancelled = 0;
        for id in ids {
            match self.cancel(id).await {
                Ok(()) => cancelled += 1,
                Err(e) => debug!(job = %id, error = %e, "job vanished while cancelling"),
            }
        }
        cancelled
    }

    /// Re-enters a failed job at `pending` with a fresh attempt budget.
    ///
    /// Acknowledged parts are kept, so the job resumes.
    pub fn retry(&self, id: JobId) -> Result<(), ManagerError> {
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let job = state.jobs.get_mut(&id).ok_or(ManagerError::UnknownJob(id))?;
            if job.status != JobStatus::Failed {
                return Err(ManagerError::NotRetryable {
                    id,
                    status: job.status,
                });
            }
            job.reset_for_retry()
                .map_err(|e| ManagerError::NotRetryable { id, status: e.from })?;
            job.retry_attempts = 0;
            let seq = state.next_seq();
            state.order.insert(id, seq);
            state.queue.insert(seq, id);
            self.inner.publish_status(state);
        }
        info!(job = %id, "job requeued for retry");
        self.inner.emit(UploadEvent::StatusChanged {
            id,
            status: JobStatus::Pending,
        });
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn get_status(&self) -> StatusSummary {
        let state = self.inner.lock();
        state.summarize(self.inner.is_paused())
    }

    /// Watch channel carrying the latest [`StatusSummary`].
    pub fn subscribe_status(&self) -> watch::Receiver<StatusSummary> {
        self.inner.status_tx.subscribe()
    }

    /// Resolves once nothing is pending, delayed, paused or active.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.subscribe_status();
        let _ = rx.wait_for(StatusSummary::is_idle).await;
    }

    pub fn get_job(&self, id: JobId) -> Option<UploadJob> {
        self.inner.lock().jobs.get(&id).cloned()
    }

    /// Known jobs in enqueue order.
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        let state = self.inner.lock();
        let mut jobs: Vec<_> = state.jobs.values().collect();
        jobs.sort_by_key(|j| (state.order.get(&j.id).copied().unwrap_or(u64::MAX), j.created_at));
        jobs.into_iter().map(JobSummary::from).collect()
    }

    /// Up to `limit` finished jobs, newest first.
    pub fn history(&self, limit: usize) -> Vec<HistoryRecord> {
        self.inner.history.recent(limit)
    }

    /// Changes the process-wide bandwidth cap (0 disables throttling).
    pub fn set_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.inner.client.throttle().set_limit(bytes_per_sec);
        info!(bytes_per_sec, "bandwidth limit changed");
    }
}
