//! Content fingerprints.
//!
//! Files below [`HashOptions::quick_hash_cutoff`] get a full SHA-256
//! (`sha256:<hex>`). Larger files get a quick hash over the size and the
//! first and last [`HashOptions::chunk_size`] bytes (`quick:<hex>`). The
//! prefixes keep the two schemes apart in every cache keyed by hash.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::DedupError;

pub const FULL_HASH_PREFIX: &str = "sha256:";
pub const QUICK_HASH_PREFIX: &str = "quick:";

const MIB: u64 = 1024 * 1024;
const READ_BUF: usize = 64 * 1024;

/// Tunables of [`HashCalculator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashOptions {
    /// Files at or above this size use the quick hash.
    pub quick_hash_cutoff: u64,
    /// Bytes read from each end of a file for the quick hash.
    pub chunk_size: u64,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self {
            quick_hash_cutoff: 64 * MIB,
            chunk_size: MIB,
        }
    }
}

impl HashOptions {
    pub fn with_quick_hash_cutoff(mut self, bytes: u64) -> Self {
        self.quick_hash_cutoff = bytes;
        self
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }
}

/// Computes file fingerprints off the async runtime.
#[derive(Debug, Clone, Default)]
pub struct HashCalculator {
    options: HashOptions,
}

impl HashCalculator {
    pub fn new(options: HashOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &HashOptions {
        &self.options
    }

    /// Returns `true` if a file of `size` bytes gets the quick hash.
    pub fn uses_quick_hash(&self, size: u64) -> bool {
        size >= self.options.quick_hash_cutoff
    }

    /// Fingerprints the file at `path`.
    pub async fn hash_file(&self, path: &Path) -> Result<String, DedupError> {
        let path = path.to_path_buf();
        let options = self.options;
        run_blocking(move || fingerprint(&path, &options)).await
    }

    /// Hex MD5 of the whole file, for comparing against plain entity tags.
    pub async fn md5_file(&self, path: &Path) -> Result<String, DedupError> {
        let path = path.to_path_buf();
        run_blocking(move || {
            let mut hasher = Md5::new();
            stream_into(&mut File::open(&path)?, |buf| hasher.update(buf))?;
            Ok(hex::encode(hasher.finalize()))
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, DedupError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DedupError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DedupError::Task(e.to_string()))?
}

fn fingerprint(path: &Path, options: &HashOptions) -> Result<String, DedupError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();

    if size < options.quick_hash_cutoff {
        let mut hasher = Sha256::new();
        stream_into(&mut file, |buf| hasher.update(buf))?;
        return Ok(format!("{FULL_HASH_PREFIX}{}", hex::encode(hasher.finalize())));
    }

    let chunk = options.chunk_size.min(size);
    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());
    hasher.update(Sha256::digest(read_chunk(&mut file, 0, chunk)?));
    hasher.update(Sha256::digest(read_chunk(&mut file, size - chunk, chunk)?));
    Ok(format!("{QUICK_HASH_PREFIX}{}", hex::encode(hasher.finalize())))
}

fn read_chunk(file: &mut File, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn stream_into(file: &mut File, mut sink: impl FnMut(&[u8])) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        sink(&buf[..n]);
    }
}
