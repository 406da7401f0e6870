//! Archive of finished jobs.
//!
//! Records are appended as JSON lines to an optional file, in completion
//! order. A bounded tail is kept in memory for queries.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};
use uplift_protocol::HistoryRecord;

use crate::error::HistoryError;

/// Append-only job history.
pub struct HistoryStore {
    path: Option<PathBuf>,
    tail: Mutex<VecDeque<HistoryRecord>>,
    capacity: usize,
}

impl HistoryStore {
    /// Opens the history file at `path`, loading its last `capacity` records.
    pub fn open(path: PathBuf, capacity: usize) -> Result<Self, HistoryError> {
        let tail = load_tail(&path, capacity)?;
        Ok(Self {
            path: Some(path),
            tail: Mutex::new(tail),
            capacity,
        })
    }

    /// A history that is never written to disk.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            path: None,
            tail: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn append(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        if let Some(path) = &self.path {
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?
                .write_all(line.as_bytes())?;
        }

        let mut tail = self.tail.lock().unwrap();
        tail.push_back(record);
        while tail.len() > self.capacity {
            tail.pop_front();
        }
        Ok(())
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<HistoryRecord> {
        self.tail
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tail.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load_tail(path: &Path, capacity: usize) -> Result<VecDeque<HistoryRecord>, HistoryError> {
    let mut tail = VecDeque::new();
    if !path.exists() {
        return Ok(tail);
    }
    let data = std::fs::read_to_string(path)?;
    for (n, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryRecord>(line) {
            Ok(record) => {
                tail.push_back(record);
                if tail.len() > capacity {
                    tail.pop_front();
                }
            }
            Err(e) => warn!(line = n + 1, error = %e, "skipping malformed history line"),
        }
    }
    debug!("loaded {} history record(s) from {:?}", tail.len(), path);
    Ok(tail)
}
