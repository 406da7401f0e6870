//! Canonical request construction.
//!
//! Percent-encoding keeps only the RFC 3986 unreserved set
//! (`A-Z a-z 0-9 - _ . ~`) and emits uppercase hex, which is what the
//! store recomputes on its side.

use sha2::{Digest, Sha256};

/// Percent-encodes a single URI component (query key/value or path segment).
pub fn encode_uri_component(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Encodes an object path segment by segment, keeping `/` separators.
///
/// The result always starts with `/`.
pub fn encode_path(path: &str) -> String {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let encoded: Vec<String> = trimmed.split('/').map(encode_uri_component).collect();
    format!("/{}", encoded.join("/"))
}

/// Builds the canonical query string: every key and value encoded, pairs
/// sorted by encoded key (then value) and joined with `&`.
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (encode_uri_component(k), encode_uri_component(v)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Assembles the canonical request text.
///
/// `headers` must already be lowercase and sorted by name.
pub(crate) fn canonical_request(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    headers: &[(&str, &str)],
    payload_hash: &str,
) -> String {
    let mut canonical_headers = String::new();
    for (name, value) in headers {
        canonical_headers.push_str(name);
        canonical_headers.push(':');
        canonical_headers.push_str(value.trim());
        canonical_headers.push('\n');
    }
    let signed = signed_header_names(headers);
    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed}\n{payload_hash}"
    )
}

/// `;`-joined header names.
pub(crate) fn signed_header_names(headers: &[(&str, &str)]) -> String {
    headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";")
}
