use std::path::PathBuf;

use uplift_protocol::{CompletedPart, JobId, UploadJob};

use crate::{MAX_OBJECT_SIZE, MAX_PARTS, MIN_PART_SIZE, TransferError};

/// One object upload as seen by the transfer layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub job_id: JobId,
    pub source: PathBuf,
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

impl TransferRequest {
    pub fn from_job(job: &UploadJob) -> Self {
        Self {
            job_id: job.id,
            source: job.source.clone(),
            bucket: job.bucket.clone(),
            key: job.key.clone(),
            size: job.total_bytes,
        }
    }
}

/// A byte range covered by one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// 1-based part number.
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Partition of an object into fixed-size parts, the last possibly shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    total: u64,
    part_size: u64,
    count: u32,
}

impl PartPlan {
    /// Plans `total` bytes using `preferred` sized parts.
    ///
    /// The part size is raised to [`MIN_PART_SIZE`], and further when
    /// `preferred` would need more than [`MAX_PARTS`] parts.
    pub fn new(total: u64, preferred: u64) -> Result<Self, TransferError> {
        if total > MAX_OBJECT_SIZE {
            return Err(TransferError::FileTooLarge(total));
        }
        let part_size = preferred
            .max(MIN_PART_SIZE)
            .max(total.div_ceil(MAX_PARTS as u64));
        let count = total.div_ceil(part_size).max(1) as u32;
        Ok(Self {
            total,
            part_size,
            count,
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Range of part `part_number` (1-based).
    pub fn part(&self, part_number: u32) -> Option<PartRange> {
        if part_number == 0 || part_number > self.count {
            return None;
        }
        let offset = (part_number as u64 - 1) * self.part_size;
        let len = self.part_size.min(self.total - offset);
        Some(PartRange {
            part_number,
            offset,
            len,
        })
    }

    pub fn parts(&self) -> impl Iterator<Item = PartRange> + '_ {
        (1..=self.count).filter_map(|n| self.part(n))
    }

    /// Returns `true` if every recorded part fits this plan.
    ///
    /// Parts recorded under a different part size cannot be reused.
    pub fn accepts(&self, parts: &[CompletedPart]) -> bool {
        parts
            .iter()
            .all(|p| self.part(p.part_number).is_some_and(|r| r.len == p.size))
    }
}
