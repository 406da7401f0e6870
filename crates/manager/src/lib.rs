//! Upload job scheduler: queue, concurrency, retries, history.
//!
//! [`UploadManager`] owns the job table. It runs up to
//! [`ManagerConfig::max_concurrent`] jobs at once, drives each through
//! duplicate detection and [`TransferClient`](uplift_transfer::TransferClient),
//! requeues transient failures with exponential backoff and archives
//! finished jobs into a [`HistoryStore`].
//!
//! # Job lifecycle
//!
//! 1. **Enqueue**: validate the source and destination, adopt persisted
//!    multipart state
//! 2. **Prepare**: fingerprint and apply the duplicate policy
//! 3. **Upload**: single PUT or resumable multipart upload
//! 4. **Settle**: complete, park, requeue with backoff, or fail

pub mod error;
pub mod history;
mod manager;
pub mod types;
mod worker;

pub use error::{EnqueueError, HistoryError, ManagerError};
pub use history::HistoryStore;
pub use manager::UploadManager;
pub use types::{JobRequest, ManagerConfig, RetryPolicy, UploadEvent};
