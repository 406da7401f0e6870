use std::path::Path;

use crate::{MAX_KEY_BYTES, MAX_OBJECT_SIZE, TransferError};

/// Validates an object key.
///
/// Rejects:
/// - Empty keys
/// - Keys longer than [`MAX_KEY_BYTES`] UTF-8 bytes
/// - Keys containing control characters
pub fn validate_object_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidKey("empty key".into()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(TransferError::KeyTooLong(key.len()));
    }
    if key.chars().any(char::is_control) {
        return Err(TransferError::InvalidKey(format!(
            "control character in key: {key:?}"
        )));
    }
    Ok(())
}

/// Validates a bucket name against the DNS-compatible naming rules.
pub fn validate_bucket_name(bucket: &str) -> Result<(), TransferError> {
    let invalid = |why: &str| Err(TransferError::InvalidBucket(format!("{bucket:?}: {why}")));

    if !(3..=63).contains(&bucket.len()) {
        return invalid("must be 3-63 characters");
    }
    if !bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return invalid("only lowercase letters, digits, '-' and '.' are allowed");
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !edge_ok(bucket.chars().next()) || !edge_ok(bucket.chars().last()) {
        return invalid("must start and end with a letter or digit");
    }
    if bucket.contains("..") {
        return invalid("consecutive dots are not allowed");
    }
    Ok(())
}

/// Checks that `path` is a readable regular file within the size limit and
/// returns its size.
pub fn validate_source(path: &Path) -> Result<u64, TransferError> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("not a regular file: {}", path.display()),
        )));
    }
    // Opening proves readability; metadata alone does not.
    std::fs::File::open(path)?;
    if meta.len() > MAX_OBJECT_SIZE {
        return Err(TransferError::FileTooLarge(meta.len()));
    }
    Ok(meta.len())
}
