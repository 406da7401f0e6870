//! Durable multipart state, so a restarted process resumes in-flight uploads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uplift_protocol::{CompletedPart, JobId, MultipartState};

use crate::types::TransferRequest;

/// Errors from the resume store.
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted multipart progress of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    pub job_id: JobId,
    pub source: PathBuf,
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub upload_id: String,
    #[serde(default)]
    pub parts: Vec<CompletedPart>,
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    /// Returns `true` if the record describes the same source and destination.
    pub fn matches(&self, source: &Path, bucket: &str, key: &str, size: u64) -> bool {
        self.source == source && self.bucket == bucket && self.key == key && self.size == size
    }

    /// Rebuilds the in-memory multipart state.
    ///
    /// A record with inconsistent parts yields `None`.
    pub fn to_state(&self) -> Option<MultipartState> {
        MultipartState::restore(Some(self.upload_id.clone()), self.parts.iter().cloned()).ok()
    }
}

/// JSON-file store of [`ResumeRecord`]s keyed by job id.
pub struct ResumeStore {
    path: Option<PathBuf>,
    records: RwLock<HashMap<JobId, ResumeRecord>>,
}

impl ResumeStore {
    /// Opens the store at `path`, loading existing records.
    pub fn open(path: PathBuf) -> Result<Self, ResumeError> {
        let records = load_records(&path)?;
        Ok(Self {
            path: Some(path),
            records: RwLock::new(records),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Records the current state of `request`.
    ///
    /// State without an upload id removes the record.
    pub fn save(&self, request: &TransferRequest, state: &MultipartState) -> Result<(), ResumeError> {
        let Some(upload_id) = state.upload_id.clone() else {
            return self.remove(request.job_id);
        };
        {
            let mut map = self.records.write().unwrap();
            map.insert(
                request.job_id,
                ResumeRecord {
                    job_id: request.job_id,
                    source: request.source.clone(),
                    bucket: request.bucket.clone(),
                    key: request.key.clone(),
                    size: request.size,
                    upload_id,
                    parts: state.completed_parts().to_vec(),
                    updated_at: Utc::now(),
                },
            );
        }
        self.persist()
    }

    /// Drops the record of `job_id`, if any.
    pub fn remove(&self, job_id: JobId) -> Result<(), ResumeError> {
        let removed = self.records.write().unwrap().remove(&job_id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(())
    }

    pub fn get(&self, job_id: JobId) -> Option<ResumeRecord> {
        self.records.read().unwrap().get(&job_id).cloned()
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<ResumeRecord> {
        let mut all: Vec<_> = self.records.read().unwrap().values().cloned().collect();
        all.sort_by_key(|r| r.updated_at);
        all
    }

    /// Moves a record matching the destination over to `job_id` and returns
    /// its multipart state.
    pub fn adopt(
        &self,
        job_id: JobId,
        source: &Path,
        bucket: &str,
        key: &str,
        size: u64,
    ) -> Option<MultipartState> {
        let (state, parts) = {
            let mut map = self.records.write().unwrap();
            let old_id = map
                .values()
                .filter(|r| r.matches(source, bucket, key, size))
                .max_by_key(|r| r.updated_at)
                .map(|r| r.job_id)?;
            let mut record = map.remove(&old_id)?;
            let Some(state) = record.to_state() else {
                warn!(job = %old_id, "discarding inconsistent resume record");
                drop(map);
                self.persist_logged();
                return None;
            };
            record.job_id = job_id;
            let parts = record.parts.len();
            map.insert(job_id, record);
            (state, parts)
        };
        self.persist_logged();
        info!(job = %job_id, bucket, key, parts, "adopted persisted multipart upload");
        Some(state)
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist resume records");
        }
    }

    /// Writes all records to disk.
    fn persist(&self) -> Result<(), ResumeError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let records = self.records();
        let json = serde_json::to_string_pretty(&records)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("persisted {} resume record(s) to {:?}", records.len(), path);
        Ok(())
    }
}

fn load_records(path: &Path) -> Result<HashMap<JobId, ResumeRecord>, ResumeError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let records: Vec<ResumeRecord> = serde_json::from_str(&data)?;
    debug!("loaded {} resume record(s) from {:?}", records.len(), path);
    Ok(records.into_iter().map(|r| (r.job_id, r)).collect())
}
