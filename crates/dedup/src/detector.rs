//! Duplicate detection against this session's uploads and the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uplift_transfer::ObjectStore;

use crate::DedupError;
use crate::hash::{HashCalculator, HashOptions};

/// Why a candidate counts as a duplicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DuplicateType {
    #[default]
    None,
    /// Same content was uploaded earlier in this session.
    RecentlyUploaded,
    /// An object already exists at the destination key.
    ExistsRemotely,
}

/// Result of [`DuplicateDetector::check_for_duplicate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub duplicate_type: DuplicateType,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_uri: Option<String>,
    /// Whether the remote object's content matches, when that is knowable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_matches: Option<bool>,
}

impl DuplicateCheck {
    fn unique(hash: String) -> Self {
        Self {
            is_duplicate: false,
            duplicate_type: DuplicateType::None,
            hash,
            existing_uri: None,
            content_matches: None,
        }
    }
}

/// An upload recorded by [`DuplicateDetector::record_upload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentUpload {
    pub uri: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Tunables of [`DuplicateDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorOptions {
    /// HEAD the destination key when the content is not a recent upload.
    pub check_remote: bool,
    pub hash: HashOptions,
    /// Recorded uploads older than this no longer count as recent.
    /// `None` keeps them for the life of the detector.
    pub recent_window: Option<Duration>,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            check_remote: true,
            hash: HashOptions::default(),
            recent_window: None,
        }
    }
}

impl DetectorOptions {
    pub fn with_check_remote(mut self, enabled: bool) -> Self {
        self.check_remote = enabled;
        self
    }

    pub fn with_hash_options(mut self, hash: HashOptions) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_recent_window(mut self, window: Duration) -> Self {
        self.recent_window = Some(window);
        self
    }
}

/// Classifies candidate uploads as new, recently uploaded, or already stored.
pub struct DuplicateDetector {
    hasher: HashCalculator,
    store: Option<Arc<dyn ObjectStore>>,
    options: DetectorOptions,
    recent: RwLock<HashMap<String, RecentUpload>>,
}

impl DuplicateDetector {
    /// Creates a detector; without a `store` no remote check is made.
    pub fn new(store: Option<Arc<dyn ObjectStore>>, options: DetectorOptions) -> Self {
        Self {
            hasher: HashCalculator::new(options.hash),
            store,
            options,
            recent: RwLock::new(HashMap::new()),
        }
    }

    pub fn hasher(&self) -> &HashCalculator {
        &self.hasher
    }

    /// Fingerprints `path` and checks it against `bucket`/`key`.
    pub async fn check_for_duplicate(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
    ) -> Result<DuplicateCheck, DedupError> {
        let hash = self.hasher.hash_file(path).await?;
        self.check_hash(hash, path, bucket, key).await
    }

    /// Like [`check_for_duplicate`](Self::check_for_duplicate) with a
    /// precomputed fingerprint.
    pub async fn check_hash(
        &self,
        hash: String,
        path: &Path,
        bucket: &str,
        key: &str,
    ) -> Result<DuplicateCheck, DedupError> {
        if let Some(recent) = self.lookup(&hash) {
            debug!(hash = %hash, uri = %recent.uri, "content uploaded earlier this session");
            return Ok(DuplicateCheck {
                is_duplicate: true,
                duplicate_type: DuplicateType::RecentlyUploaded,
                hash,
                existing_uri: Some(recent.uri),
                content_matches: Some(true),
            });
        }

        let Some(store) = self.store.as_ref().filter(|_| self.options.check_remote) else {
            return Ok(DuplicateCheck::unique(hash));
        };
        let Some(meta) = store.head_object(bucket, key).await? else {
            return Ok(DuplicateCheck::unique(hash));
        };

        let size = tokio::fs::metadata(path).await?.len();
        let content_matches = if meta.size != size {
            Some(false)
        } else if let (Some(etag), false) = (meta.plain_etag(), self.hasher.uses_quick_hash(size)) {
            Some(self.hasher.md5_file(path).await? == etag)
        } else {
            None
        };
        debug!(bucket, key, ?content_matches, "destination key already exists");

        Ok(DuplicateCheck {
            is_duplicate: true,
            duplicate_type: DuplicateType::ExistsRemotely,
            hash,
            existing_uri: Some(object_uri(bucket, key)),
            content_matches,
        })
    }

    /// Remembers a finished upload so later candidates with the same
    /// content are recognized without a remote check.
    pub fn record_upload(&self, hash: &str, bucket: &str, key: &str) {
        self.recent.write().unwrap().insert(
            hash.to_string(),
            RecentUpload {
                uri: object_uri(bucket, key),
                uploaded_at: Utc::now(),
            },
        );
    }

    /// The recorded upload of `hash`, if it is inside the recent window.
    pub fn lookup(&self, hash: &str) -> Option<RecentUpload> {
        let cutoff = self.options.recent_window.and_then(cutoff_for);
        self.recent
            .read()
            .unwrap()
            .get(hash)
            .filter(|r| cutoff.is_none_or(|c| r.uploaded_at >= c))
            .cloned()
    }

    /// Recorded uploads no older than `max_age`, newest first.
    pub fn recent(&self, max_age: Duration) -> Vec<(String, RecentUpload)> {
        let cutoff = cutoff_for(max_age);
        let mut entries: Vec<_> = self
            .recent
            .read()
            .unwrap()
            .iter()
            .filter(|(_, r)| cutoff.is_none_or(|c| r.uploaded_at >= c))
            .map(|(h, r)| (h.clone(), r.clone()))
            .collect();
        entries.sort_by(|a, b| b.1.uploaded_at.cmp(&a.1.uploaded_at));
        entries
    }

    pub fn clear(&self) {
        self.recent.write().unwrap().clear();
    }

    /// Groups `paths` by content. Only groups with more than one member
    /// are returned, each in input order. Unreadable files are skipped.
    pub async fn find_local_duplicates(&self, paths: &[PathBuf]) -> Vec<Vec<PathBuf>> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for path in paths {
            let hash = match self.hasher.hash_file(path).await {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let group = groups.entry(hash.clone()).or_default();
            if group.is_empty() {
                order.push(hash);
            }
            group.push(path.clone());
        }
        order
            .into_iter()
            .filter_map(|hash| groups.remove(&hash))
            .filter(|group| group.len() > 1)
            .collect()
    }
}

fn object_uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

/// Oldest timestamp still within `max_age` of now.
fn cutoff_for(max_age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
}

#[cfg(test)]
mod tests {
    use uplift_transfer::{MemoryObjectStore, StoreOp};

    use super::*;

    fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn second_upload_is_recent_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write(tmp.path(), "a.wav", b"take one");
        let b = write(tmp.path(), "b.wav", b"take one");
        let detector = DuplicateDetector::new(None, DetectorOptions::default());

        let first = detector.check_for_duplicate(&a, "media", "a.wav").await.unwrap();
        assert!(!first.is_duplicate);
        detector.record_upload(&first.hash, "media", "a.wav");

        let second = detector.check_for_duplicate(&b, "other", "b.wav").await.unwrap();
        assert!(second.is_duplicate);
        assert_eq!(second.duplicate_type, DuplicateType::RecentlyUploaded);
        assert_eq!(second.existing_uri.as_deref(), Some("s3://media/a.wav"));
    }

    #[tokio::test]
    async fn uploads_outside_recent_window_are_forgotten() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "a.wav", b"take one");
        let detector = DuplicateDetector::new(
            None,
            DetectorOptions::default().with_recent_window(Duration::from_secs(3600)),
        );
        let hash = detector.hasher().hash_file(&path).await.unwrap();

        detector.record_upload(&hash, "media", "a.wav");
        assert!(detector.lookup(&hash).is_some());
        let check = detector.check_for_duplicate(&path, "media", "b.wav").await.unwrap();
        assert_eq!(check.duplicate_type, DuplicateType::RecentlyUploaded);

        // Age the record past the window.
        detector.recent.write().unwrap().get_mut(&hash).unwrap().uploaded_at =
            Utc::now() - chrono::Duration::hours(2);
        assert!(detector.lookup(&hash).is_none());
        let check = detector.check_for_duplicate(&path, "media", "b.wav").await.unwrap();
        assert!(!check.is_duplicate);
        assert_eq!(detector.recent(Duration::from_secs(3 * 3600)).len(), 1);
    }

    #[tokio::test]
    async fn existing_key_is_remote_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "a.wav", b"take one");
        let store = Arc::new(MemoryObjectStore::new());
        store.insert_object("media", "a.wav", b"take one".to_vec());
        store.insert_object("media", "b.wav", b"take two".to_vec());
        let detector = DuplicateDetector::new(
            Some(store.clone() as Arc<dyn ObjectStore>),
            DetectorOptions::default(),
        );

        let same = detector.check_for_duplicate(&path, "media", "a.wav").await.unwrap();
        assert_eq!(same.duplicate_type, DuplicateType::ExistsRemotely);
        assert_eq!(same.content_matches, Some(true));

        let differs = detector.check_for_duplicate(&path, "media", "b.wav").await.unwrap();
        assert!(differs.is_duplicate);
        assert_eq!(differs.content_matches, Some(false));

        let fresh = detector.check_for_duplicate(&path, "media", "c.wav").await.unwrap();
        assert!(!fresh.is_duplicate);
        assert_eq!(store.calls(StoreOp::Head), 3);
    }

    #[tokio::test]
    async fn remote_check_can_be_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "a.wav", b"x");
        let store = Arc::new(MemoryObjectStore::new());
        store.insert_object("media", "a.wav", b"x".to_vec());
        let detector = DuplicateDetector::new(
            Some(store.clone() as Arc<dyn ObjectStore>),
            DetectorOptions::default().with_check_remote(false),
        );

        let check = detector.check_for_duplicate(&path, "media", "a.wav").await.unwrap();
        assert!(!check.is_duplicate);
        assert_eq!(store.calls(StoreOp::Head), 0);
    }

    #[tokio::test]
    async fn local_scan_groups_identical_files() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write(tmp.path(), "a.wav", b"same");
        let b = write(tmp.path(), "b.wav", b"other");
        let c = write(tmp.path(), "c.wav", b"same");
        let missing = tmp.path().join("gone.wav");
        let detector = DuplicateDetector::new(None, DetectorOptions::default());

        let groups = detector
            .find_local_duplicates(&[a.clone(), b, missing, c.clone()])
            .await;
        assert_eq!(groups, vec![vec![a, c]]);
    }

    #[test]
    fn recent_filters_and_clears() {
        let detector = DuplicateDetector::new(None, DetectorOptions::default());
        detector.record_upload("sha256:aa", "media", "a.wav");
        detector.recent.write().unwrap().insert(
            "sha256:bb".into(),
            RecentUpload {
                uri: "s3://media/b.wav".into(),
                uploaded_at: Utc::now() - chrono::Duration::hours(2),
            },
        );

        let fresh = detector.recent(Duration::from_secs(3600));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].0, "sha256:aa");
        assert_eq!(detector.recent(Duration::from_secs(3 * 3600)).len(), 2);

        detector.clear();
        assert!(detector.lookup("sha256:aa").is_none());
    }
}
