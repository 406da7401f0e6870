//! Upload jobs and their lifecycle.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque unique identifier of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// State of an upload job.
///
/// ```text
/// pending -> preparing -> uploading <-> paused -> completed | failed | cancelled
///                                          failed -> pending (retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Preparing,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns `true` for states a job never leaves on its own.
    ///
    /// `Failed` counts as terminal even though an explicit retry may
    /// re-enter the job at `Pending`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Preparing | Uploading | Paused | Cancelled),
            Preparing => matches!(next, Uploading | Paused | Completed | Failed | Cancelled),
            Uploading => matches!(next, Paused | Completed | Failed | Cancelled),
            Paused => matches!(next, Pending | Uploading | Cancelled),
            Failed => matches!(next, Pending),
            Completed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A multipart chunk acknowledged by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    #[serde(rename = "eTag")]
    pub etag: String,
    pub size: u64,
}

/// Rejected completed-part insertion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartError {
    #[error("part numbers start at 1")]
    ZeroPartNumber,

    #[error("part {0} already recorded")]
    Duplicate(u32),
}

/// Resumable multipart state of a job.
///
/// `completed_parts` is kept sorted by part number with no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default)]
    completed_parts: Vec<CompletedPart>,
}

impl MultipartState {
    /// Creates state for an already initiated upload.
    pub fn with_upload_id(upload_id: impl Into<String>) -> Self {
        Self {
            upload_id: Some(upload_id.into()),
            completed_parts: Vec::new(),
        }
    }

    /// Rebuilds state from persisted parts, restoring the ordering invariant.
    pub fn restore(
        upload_id: Option<String>,
        parts: impl IntoIterator<Item = CompletedPart>,
    ) -> Result<Self, PartError> {
        let mut state = Self {
            upload_id,
            completed_parts: Vec::new(),
        };
        for part in parts {
            state.insert_part(part)?;
        }
        Ok(state)
    }

    /// Inserts an acknowledged part at its ordered position.
    pub fn insert_part(&mut self, part: CompletedPart) -> Result<(), PartError> {
        if part.part_number == 0 {
            return Err(PartError::ZeroPartNumber);
        }
        match self
            .completed_parts
            .binary_search_by_key(&part.part_number, |p| p.part_number)
        {
            Ok(_) => Err(PartError::Duplicate(part.part_number)),
            Err(pos) => {
                self.completed_parts.insert(pos, part);
                Ok(())
            }
        }
    }

    /// Parts sorted by part number.
    pub fn completed_parts(&self) -> &[CompletedPart] {
        &self.completed_parts
    }

    pub fn has_part(&self, part_number: u32) -> bool {
        self.completed_parts
            .binary_search_by_key(&part_number, |p| p.part_number)
            .is_ok()
    }

    /// Bytes covered by acknowledged parts.
    pub fn completed_bytes(&self) -> u64 {
        self.completed_parts.iter().map(|p| p.size).sum()
    }

    /// Returns `true` once an upload id has been issued.
    pub fn is_started(&self) -> bool {
        self.upload_id.is_some()
    }

    /// Forgets the upload id and all parts.
    pub fn clear(&mut self) {
        self.upload_id = None;
        self.completed_parts.clear();
    }
}

/// Transfer progress of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub bytes_uploaded: u64,
    /// Instantaneous speed in bytes/second.
    pub speed_bps: f64,
}

/// How a completed job was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Uploaded,
    SkippedDuplicate,
}

/// An upload of one local file to one destination object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadJob {
    pub id: JobId,
    pub source: PathBuf,
    pub bucket: String,
    pub key: String,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub retry_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_errors: Vec<String>,
    #[serde(default)]
    pub multipart: MultipartState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest instant a scheduled retry may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl UploadJob {
    /// Creates a pending job.
    pub fn new(
        source: impl Into<PathBuf>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        total_bytes: u64,
    ) -> Self {
        Self {
            id: JobId::new(),
            source: source.into(),
            bucket: bucket.into(),
            key: key.into(),
            total_bytes,
            content_hash: None,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            retry_attempts: 0,
            last_error: None,
            retry_errors: Vec::new(),
            multipart: MultipartState::default(),
            final_etag: None,
            outcome: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
        }
    }

    /// Sets a precomputed content hash.
    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Updates uploaded bytes, clamped to `total_bytes`.
    pub fn set_bytes_uploaded(&mut self, bytes: u64) {
        self.progress.bytes_uploaded = bytes.min(self.total_bytes);
    }

    /// Moves the job to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        let now = Utc::now();
        match next {
            JobStatus::Uploading if self.started_at.is_none() => self.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now);
                self.progress.speed_bps = 0.0;
            }
            _ => {}
        }
        Ok(())
    }

    /// Finishes the job with the store's final entity tag.
    pub fn mark_completed(
        &mut self,
        etag: impl Into<String>,
        outcome: JobOutcome,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Completed)?;
        self.progress.bytes_uploaded = self.total_bytes;
        self.final_etag = Some(etag.into());
        self.outcome = Some(outcome);
        self.last_error = None;
        Ok(())
    }

    /// Finishes the job without a transfer because the content is already
    /// stored.
    pub fn mark_skipped(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Completed)?;
        self.progress.bytes_uploaded = self.total_bytes;
        self.outcome = Some(JobOutcome::SkippedDuplicate);
        self.last_error = None;
        Ok(())
    }

    /// Records a failed attempt; the message is kept for diagnostics.
    pub fn record_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.retry_errors.push(error.clone());
        self.last_error = Some(error);
    }

    /// Re-enters the job at `Pending` for another attempt.
    ///
    /// Clears the transient error and speed, keeps the upload id and the
    /// acknowledged parts, and rewinds the byte counter to what those parts
    /// cover so the next attempt resumes rather than restarts.
    pub fn reset_for_retry(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Pending)?;
        self.last_error = None;
        self.completed_at = None;
        self.next_attempt_at = None;
        self.progress.speed_bps = 0.0;
        let acked = self.multipart.completed_bytes();
        self.set_bytes_uploaded(acked);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `s3://bucket/key` form of the destination.
    pub fn remote_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}
