//! S3 XML bodies for multipart requests and error responses.

use serde::{Deserialize, Serialize};
use uplift_protocol::CompletedPart;

use crate::TransferError;

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: Vec<XmlPart<'a>>,
}

#[derive(Debug, Serialize)]
struct XmlPart<'a> {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

#[derive(Debug, Deserialize)]
struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId")]
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag")]
    etag: String,
}

/// Parsed `<Error>` document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct S3Error {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

/// Serializes the complete-multipart-upload request body.
pub(crate) fn complete_body(parts: &[CompletedPart]) -> Result<String, TransferError> {
    let doc = CompleteMultipartUpload {
        parts: parts
            .iter()
            .map(|p| XmlPart {
                part_number: p.part_number,
                etag: &p.etag,
            })
            .collect(),
    };
    quick_xml::se::to_string(&doc)
        .map_err(|e| TransferError::InvalidResponse(format!("encode complete body: {e}")))
}

pub(crate) fn parse_upload_id(body: &str) -> Result<String, TransferError> {
    let result: InitiateMultipartUploadResult = quick_xml::de::from_str(body)
        .map_err(|e| TransferError::InvalidResponse(format!("initiate response: {e}")))?;
    if result.upload_id.is_empty() {
        return Err(TransferError::InvalidResponse("empty UploadId".into()));
    }
    Ok(result.upload_id)
}

pub(crate) fn parse_complete_etag(body: &str) -> Result<String, TransferError> {
    let result: CompleteMultipartUploadResult = quick_xml::de::from_str(body)
        .map_err(|e| TransferError::InvalidResponse(format!("complete response: {e}")))?;
    Ok(result.etag)
}

/// Parses an error document; `None` if `body` is not one.
pub(crate) fn parse_error(body: &str) -> Option<S3Error> {
    if !body.contains("<Error>") {
        return None;
    }
    quick_xml::de::from_str(body).ok()
}
