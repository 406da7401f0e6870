use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;
use crate::types::PartRange;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Base64 SHA-256, the form of the `x-amz-checksum-sha256` header.
pub fn sha256_base64(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Hex MD5, the form of a plain single-PUT entity tag.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Base64 MD5, the form of the `Content-MD5` header.
pub fn content_md5(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

// ---------------------------------------------------------------------------
// PartReader
// ---------------------------------------------------------------------------

/// Reads byte ranges of a source file.
///
/// Each read opens its own handle so concurrent part sends never share a
/// file cursor.
#[derive(Debug, Clone)]
pub struct PartReader {
    path: PathBuf,
    file_size: u64,
}

impl PartReader {
    /// Opens `path` and checks it still has `expected_size` bytes.
    pub async fn open(path: &Path, expected_size: u64) -> Result<Self, TransferError> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }
        if meta.len() != expected_size {
            return Err(TransferError::SourceChanged {
                expected: expected_size,
                actual: meta.len(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            file_size: meta.len(),
        })
    }

    /// Reads `len` bytes starting at `offset`.
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, TransferError> {
        if offset.saturating_add(len) > self.file_size {
            return Err(TransferError::SourceChanged {
                expected: offset + len,
                actual: self.file_size,
            });
        }
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads the bytes of one planned part.
    pub async fn read_part(&self, part: &PartRange) -> Result<Vec<u8>, TransferError> {
        self.read_range(part.offset, part.len).await
    }

    /// Reads the whole file.
    pub async fn read_all(&self) -> Result<Vec<u8>, TransferError> {
        self.read_range(0, self.file_size).await
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn checksum_forms() {
        assert_eq!(checksum_bytes(b"hello world").len(), 64);
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert_eq!(
            sha256_base64(b""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[tokio::test]
    async fn reads_ranges() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "clip.bin", b"0123456789");

        let reader = PartReader::open(&path, 10).await.unwrap();
        assert_eq!(reader.read_range(6, 4).await.unwrap(), b"6789");
        let part = PartRange {
            part_number: 1,
            offset: 0,
            len: 4,
        };
        assert_eq!(reader.read_part(&part).await.unwrap(), b"0123");
        assert_eq!(reader.read_all().await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn size_change_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "clip.bin", b"0123456789");

        let err = PartReader::open(&path, 11).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::SourceChanged {
                expected: 11,
                actual: 10
            }
        ));

        let reader = PartReader::open(&path, 10).await.unwrap();
        assert!(reader.read_range(8, 4).await.is_err());
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = PartReader::open(&dir.path().join("nope"), 1).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
