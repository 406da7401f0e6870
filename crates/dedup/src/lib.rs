//! Content fingerprints and duplicate detection for uploads.
//!
//! [`HashCalculator`] fingerprints files, and [`DuplicateDetector`] checks a
//! fingerprint against uploads finished this session and, optionally, the
//! destination key in the store. Deciding what to do with a duplicate is
//! left to the caller.

pub mod detector;
pub mod error;
pub mod hash;

pub use detector::{DetectorOptions, DuplicateCheck, DuplicateDetector, DuplicateType, RecentUpload};
pub use error::DedupError;
pub use hash::{FULL_HASH_PREFIX, HashCalculator, HashOptions, QUICK_HASH_PREFIX};
