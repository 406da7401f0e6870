//! Execution of one dispatched job.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use uplift_dedup::DedupError;
use uplift_protocol::{DuplicateAction, JobOutcome, JobStatus, UploadJob};
use uplift_transfer::{
    ObjectStore, SpeedCalculator, TransferError, TransferRequest, TransferSignals, UploadReport,
};

use crate::manager::Shared;
use crate::types::UploadEvent;

/// Keys probed by the rename policy before giving up.
const MAX_RENAME_PROBES: u32 = 100;

enum Finish {
    Uploaded(UploadReport),
    Skipped,
}

/// Runs `job` to a settled state and hands it back to the scheduler.
pub(crate) async fn run(shared: Arc<Shared>, mut job: UploadJob, cancel: CancellationToken) {
    job.next_attempt_at = None;
    info!(
        job = %job.id,
        key = %job.key,
        attempt = job.retry_attempts + 1,
        "job started"
    );
    let result = execute(&shared, &mut job, &cancel).await;
    settle(&shared, job, result, &cancel).await;
}

async fn execute(
    shared: &Shared,
    job: &mut UploadJob,
    cancel: &CancellationToken,
) -> Result<Finish, TransferError> {
    set_status(shared, job, JobStatus::Preparing);
    let signals = TransferSignals::new(cancel.clone(), shared.pause_tx.subscribe());

    if job.multipart.is_started() {
        // Resumed uploads keep their destination; only the fingerprint is
        // needed so the finished upload registers as recent.
        fingerprint(shared, job).await?;
    } else if prepare(shared, job).await? {
        return Ok(Finish::Skipped);
    }

    set_status(shared, job, JobStatus::Uploading);
    let request = TransferRequest::from_job(job);
    let mut multipart = std::mem::take(&mut job.multipart);
    let (id, total) = (job.id, job.total_bytes);
    let mut speed = SpeedCalculator::default();
    let mut last = multipart.completed_bytes();
    let mut on_progress = |bytes: u64| {
        speed.record(bytes.saturating_sub(last));
        last = bytes;
        let speed_bps = speed.bytes_per_second();
        shared.record_progress(id, bytes, speed_bps);
        shared.emit(UploadEvent::Progress {
            id,
            bytes_uploaded: bytes.min(total),
            total_bytes: total,
            speed_bps,
        });
    };

    let result = shared
        .client
        .upload(&request, &mut multipart, &mut on_progress, &signals)
        .await;
    job.multipart = multipart;
    job.set_bytes_uploaded(job.multipart.completed_bytes());
    result.map(Finish::Uploaded)
}

/// Fingerprints the source and applies the duplicate policy.
///
/// Returns `true` if the job should complete without uploading.
async fn prepare(shared: &Shared, job: &mut UploadJob) -> Result<bool, TransferError> {
    let hash = fingerprint(shared, job).await?;

    let check = match shared
        .detector
        .check_hash(hash, &job.source, &job.bucket, &job.key)
        .await
    {
        Ok(check) => check,
        Err(DedupError::Remote(e)) => {
            warn!(job = %job.id, error = %e, "remote duplicate check failed, uploading anyway");
            return Ok(false);
        }
        Err(e) => return Err(dedup_failure(e)),
    };
    if !check.is_duplicate {
        return Ok(false);
    }

    let action = shared.config.duplicate_action;
    let kind = check.duplicate_type;
    let existing = check.existing_uri.clone().unwrap_or_default();
    shared.emit(UploadEvent::DuplicateDetected { id: job.id, check });

    match action {
        DuplicateAction::Skip => {
            info!(job = %job.id, ?kind, existing = %existing, "duplicate skipped");
            Ok(true)
        }
        DuplicateAction::Warn => {
            warn!(job = %job.id, ?kind, existing = %existing, "uploading duplicate content");
            Ok(false)
        }
        DuplicateAction::Overwrite => {
            debug!(job = %job.id, ?kind, "overwriting duplicate");
            Ok(false)
        }
        DuplicateAction::Rename => {
            let store = shared.client.store().as_ref();
            let key = free_key(store, &job.bucket, &job.key).await?;
            if key != job.key {
                info!(job = %job.id, from = %job.key, to = %key, "renamed duplicate");
                job.key = key;
            }
            Ok(false)
        }
    }
}

/// The job's content hash, computed from the source on first use.
async fn fingerprint(shared: &Shared, job: &mut UploadJob) -> Result<String, TransferError> {
    if let Some(hash) = &job.content_hash {
        return Ok(hash.clone());
    }
    let hash = shared
        .detector
        .hasher()
        .hash_file(&job.source)
        .await
        .map_err(dedup_failure)?;
    job.content_hash = Some(hash.clone());
    Ok(hash)
}

fn dedup_failure(err: DedupError) -> TransferError {
    match err {
        DedupError::Io(e) => TransferError::Io(e),
        DedupError::Remote(e) => e,
        DedupError::Task(msg) => TransferError::Io(std::io::Error::other(msg)),
    }
}

/// First key among `key`, `name-1.ext`, `name-2.ext`, ... with no object.
async fn free_key(store: &dyn ObjectStore, bucket: &str, key: &str) -> Result<String, TransferError> {
    if store.head_object(bucket, key).await?.is_none() {
        return Ok(key.to_string());
    }
    for n in 1..=MAX_RENAME_PROBES {
        let candidate = numbered_key(key, n);
        if store.head_object(bucket, &candidate).await?.is_none() {
            return Ok(candidate);
        }
    }
    Err(TransferError::InvalidKey(format!(
        "no free key after {MAX_RENAME_PROBES} probes: {key}"
    )))
}

/// Inserts `-n` before the extension of the last path segment.
pub(crate) fn numbered_key(key: &str, n: u32) -> String {
    let (dir, name) = match key.rfind('/') {
        Some(slash) => key.split_at(slash + 1),
        None => ("", key),
    };
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{dir}{}-{n}{}", &name[..dot], &name[dot..]),
        _ => format!("{dir}{name}-{n}"),
    }
}

fn set_status(shared: &Shared, job: &mut UploadJob, status: JobStatus) {
    if let Err(e) = job.transition(status) {
        warn!(job = %job.id, error = %e, "ignoring invalid transition");
        return;
    }
    shared.store_snapshot(job);
    shared.emit(UploadEvent::StatusChanged { id: job.id, status });
}

/// Decides the job's next state from the attempt result and releases its
/// slot.
async fn settle(
    shared: &Shared,
    mut job: UploadJob,
    result: Result<Finish, TransferError>,
    cancel: &CancellationToken,
) {
    let id = job.id;
    let mut retry_at = None;
    let mut event = None;

    match result {
        Ok(Finish::Uploaded(report)) => {
            if let Err(e) = job.mark_completed(report.etag.clone(), JobOutcome::Uploaded) {
                warn!(job = %id, error = %e, "cannot complete job");
            }
            if let Some(hash) = &job.content_hash {
                shared.detector.record_upload(hash, &job.bucket, &job.key);
            }
            info!(
                job = %id,
                etag = %report.etag,
                multipart = report.multipart,
                parts = report.parts_sent,
                "job completed"
            );
            event = Some(UploadEvent::Completed {
                id,
                outcome: JobOutcome::Uploaded,
                etag: Some(report.etag),
            });
        }
        Ok(Finish::Skipped) => {
            if let Err(e) = job.mark_skipped() {
                warn!(job = %id, error = %e, "cannot complete job");
            }
            event = Some(UploadEvent::Completed {
                id,
                outcome: JobOutcome::SkippedDuplicate,
                etag: None,
            });
        }
        Err(e) if shared.shutdown.is_cancelled() => {
            info!(job = %id, error = %e, "job interrupted by shutdown");
            park(&mut job, JobStatus::Paused);
        }
        Err(e) if cancel.is_cancelled() || matches!(e, TransferError::Cancelled) => {
            if job.multipart.is_started() {
                let request = TransferRequest::from_job(&job);
                if let Err(e) = shared.client.abort(&request, &mut job.multipart).await {
                    warn!(job = %id, error = %e, "failed to abort multipart upload");
                }
            }
            park(&mut job, JobStatus::Cancelled);
            info!(job = %id, "job cancelled");
        }
        Err(TransferError::Paused) => {
            park(&mut job, JobStatus::Paused);
            info!(job = %id, bytes = job.progress.bytes_uploaded, "job paused");
        }
        Err(e) if shared.is_transient(&e) && shared.config.retry.allows_retry(job.retry_attempts) => {
            let message = e.to_string();
            job.record_error(message.clone());
            park(&mut job, JobStatus::Failed);
            if let Err(e) = job.reset_for_retry() {
                warn!(job = %id, error = %e, "cannot requeue job");
            }
            job.retry_attempts += 1;
            let delay = shared.config.retry.delay_for_attempt(job.retry_attempts);
            job.next_attempt_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d));
            retry_at = Some(Instant::now() + delay);
            warn!(
                job = %id,
                attempt = job.retry_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "transient failure, retry scheduled"
            );
            event = Some(UploadEvent::RetryScheduled {
                id,
                attempt: job.retry_attempts,
                delay,
                error: message,
            });
        }
        Err(e) => {
            let message = e.to_string();
            job.record_error(message.clone());
            park(&mut job, JobStatus::Failed);
            error!(job = %id, attempts = job.retry_attempts + 1, error = %message, "job failed");
            event = Some(UploadEvent::Failed { id, error: message });
        }
    }

    let status = {
        let mut guard = shared.lock();
        let state = &mut *guard;
        state.running.remove(&id);
        if job.status == JobStatus::Paused && !shared.is_paused() && !shared.shutdown.is_cancelled() {
            // Resumed while the last call was still in flight.
            park(&mut job, JobStatus::Pending);
        }
        match job.status {
            JobStatus::Pending => match retry_at {
                Some(due) => state.schedule_retry(id, due),
                None => state.requeue(id),
            },
            status if status.is_terminal() => state.archive(id, shared.config.retain_finished),
            _ => {}
        }
        state.jobs.insert(id, job.clone());
        shared.publish_status(state);
        job.status
    };

    if status.is_terminal() {
        shared.write_history(&job);
    }
    shared.emit(UploadEvent::StatusChanged { id, status });
    if let Some(event) = event {
        shared.emit(event);
    }
    shared.wake.notify_one();
}

fn park(job: &mut UploadJob, status: JobStatus) {
    if let Err(e) = job.transition(status) {
        warn!(job = %job.id, error = %e, "ignoring invalid transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_key_keeps_extension_and_prefix() {
        assert_eq!(numbered_key("clips/take.mov", 1), "clips/take-1.mov");
        assert_eq!(numbered_key("take.tar.gz", 2), "take.tar-2.gz");
        assert_eq!(numbered_key("clips/README", 3), "clips/README-3");
        assert_eq!(numbered_key("clips.v2/.hidden", 4), "clips.v2/.hidden-4");
    }
}
