//! Manager configuration, job requests and events.

use std::path::PathBuf;
use std::time::Duration;

use uplift_dedup::DuplicateCheck;
use uplift_protocol::{DuplicateAction, JobId, JobOutcome, JobStatus};

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per job, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Returns `true` if a job that already used `retries` retries may
    /// try again.
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries.saturating_add(1) < self.max_attempts
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Jobs executing at once.
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
    /// What to do with duplicates found while preparing.
    pub duplicate_action: DuplicateAction,
    /// Finished jobs kept for `get_job`/`list_jobs`.
    pub retain_finished: usize,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            retry: RetryPolicy::default(),
            duplicate_action: DuplicateAction::default(),
            retain_finished: 200,
            event_capacity: 256,
        }
    }
}

impl ManagerConfig {
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_duplicate_action(mut self, action: DuplicateAction) -> Self {
        self.duplicate_action = action;
        self
    }

    pub fn with_retain_finished(mut self, n: usize) -> Self {
        self.retain_finished = n;
        self
    }
}

/// A file to upload, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub source: PathBuf,
    pub bucket: String,
    pub key: String,
    /// Fingerprint computed by the caller, if any.
    pub content_hash: Option<String>,
}

impl JobRequest {
    pub fn new(source: impl Into<PathBuf>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            bucket: bucket.into(),
            key: key.into(),
            content_hash: None,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// Events published by the manager.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    StatusChanged {
        id: JobId,
        status: JobStatus,
    },
    Progress {
        id: JobId,
        bytes_uploaded: u64,
        total_bytes: u64,
        speed_bps: f64,
    },
    DuplicateDetected {
        id: JobId,
        check: DuplicateCheck,
    },
    RetryScheduled {
        id: JobId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Completed {
        id: JobId,
        outcome: JobOutcome,
        etag: Option<String>,
    },
    Failed {
        id: JobId,
        error: String,
    },
}
