//! Shared types for the uplift transfer engine.
//!
//! - [`job`]: upload jobs, their state machine and multipart bookkeeping
//! - [`types`]: status summaries, history records and policy enums
//! - [`envelope`]: request/response envelope of the local control protocol

pub mod envelope;
pub mod job;
pub mod types;

pub use envelope::{ControlRequest, ControlResponse};
pub use job::{
    CompletedPart, InvalidTransition, JobId, JobOutcome, JobProgress, JobStatus, MultipartState,
    PartError, UploadJob,
};
pub use types::{DuplicateAction, HistoryRecord, JobSummary, StatusSummary};
