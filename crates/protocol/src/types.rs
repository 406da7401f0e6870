use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobOutcome, JobStatus, UploadJob};

/// What to do when a candidate upload looks like a duplicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    /// Complete the job without transferring.
    Skip,
    /// Log and emit an event, then upload anyway.
    #[default]
    Warn,
    /// Upload under the first free `name-N.ext` key.
    Rename,
    /// Upload over the existing object.
    Overwrite,
}

impl FromStr for DuplicateAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "warn" => Ok(Self::Warn),
            "rename" => Ok(Self::Rename),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(format!("unknown duplicate action: {other}")),
        }
    }
}

impl fmt::Display for DuplicateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skip => "skip",
            Self::Warn => "warn",
            Self::Rename => "rename",
            Self::Overwrite => "overwrite",
        };
        f.write_str(s)
    }
}

/// Aggregate scheduler status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    /// Jobs waiting for a slot, including scheduled retries.
    pub pending: usize,
    /// Jobs preparing or uploading.
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    /// Byte-weighted progress across known, non-cancelled jobs (0-100).
    pub progress_percent: f64,
    /// At least one job is uploading.
    pub is_running: bool,
    /// Manager-level pause is set and nothing is transmitting.
    pub is_paused: bool,
}

impl StatusSummary {
    /// Nothing left to schedule or run.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.active == 0 && self.paused == 0
    }
}

/// Compact job view for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    pub source: String,
    pub bucket: String,
    pub key: String,
    pub status: JobStatus,
    pub total_bytes: u64,
    pub bytes_uploaded: u64,
    pub speed_bps: f64,
    pub retry_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&UploadJob> for JobSummary {
    fn from(job: &UploadJob) -> Self {
        Self {
            id: job.id,
            source: job.source.to_string_lossy().into_owned(),
            bucket: job.bucket.clone(),
            key: job.key.clone(),
            status: job.status,
            total_bytes: job.total_bytes,
            bytes_uploaded: job.progress.bytes_uploaded,
            speed_bps: job.progress.speed_bps,
            retry_attempts: job.retry_attempts,
            last_error: job.last_error.clone(),
        }
    }
}

/// Archived outcome of a job that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub job_id: JobId,
    pub source: String,
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl From<&UploadJob> for HistoryRecord {
    fn from(job: &UploadJob) -> Self {
        Self {
            job_id: job.id,
            source: job.source.to_string_lossy().into_owned(),
            bucket: job.bucket.clone(),
            key: job.key.clone(),
            size: job.total_bytes,
            status: job.status,
            outcome: job.outcome,
            etag: job.final_etag.clone(),
            content_hash: job.content_hash.clone(),
            error: job.last_error.clone(),
            attempts: job.retry_attempts + 1,
            started_at: job.started_at,
            finished_at: job.completed_at.unwrap_or_else(Utc::now),
        }
    }
}
