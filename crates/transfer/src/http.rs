//! `ObjectStore` backend speaking the S3 REST API over reqwest.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode, Url};
use tracing::{debug, warn};
use uplift_protocol::CompletedPart;
use uplift_signer::{
    CredentialProvider, RequestSigner, SignableRequest, SignerError, canonical_query, encode_path,
    sha256_hex,
};

use crate::store::{ObjectMeta, ObjectStore, StoreFuture};
use crate::{TransferError, xml};

/// Per-part SHA-256 checksum, signed like the other `x-amz-*` headers.
const CHECKSUM_HEADER: &str = "x-amz-checksum-sha256";

/// How requests are authorized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SigningMode {
    /// Presigned query string (`X-Amz-Signature=...`).
    #[default]
    Query,
    /// `Authorization` header with a signed payload hash.
    Header,
}

/// Connection settings for [`HttpObjectStore`].
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Base URL, e.g. `https://s3.eu-west-1.amazonaws.com`.
    pub endpoint: String,
    pub region: String,
    /// Address buckets as `/bucket/key` instead of `bucket.host/key`.
    pub path_style: bool,
    pub signing: SigningMode,
    /// Validity of each presigned request.
    pub presign_expiry: Duration,
    /// Transport-level timeout per request.
    pub request_timeout: Duration,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://s3.us-east-1.amazonaws.com".into(),
            region: "us-east-1".into(),
            path_style: false,
            signing: SigningMode::Query,
            presign_expiry: Duration::from_secs(15 * 60),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Scheme, host and unencoded path of one object request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    scheme: String,
    host: String,
    path: String,
}

struct Response {
    status: StatusCode,
    etag: Option<String>,
    content_length: Option<u64>,
    body: String,
}

/// S3 REST client.
pub struct HttpObjectStore {
    http: reqwest::Client,
    base: Url,
    config: HttpStoreConfig,
    signer: RequestSigner,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpObjectStore {
    pub fn new(
        config: HttpStoreConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, TransferError> {
        let base = Url::parse(&config.endpoint)
            .map_err(|e| SignerError::InvalidUrl(format!("{}: {e}", config.endpoint)))?;
        if base.host_str().is_none() {
            return Err(SignerError::InvalidUrl(format!("{}: missing host", config.endpoint)).into());
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransferError::Network(e.to_string()))?;
        let signer = RequestSigner::s3(config.region.clone());
        Ok(Self {
            http,
            base,
            config,
            signer,
            credentials,
        })
    }

    fn target(&self, bucket: &str, key: &str) -> Target {
        let mut host = self.base.host_str().unwrap_or_default().to_string();
        if let Some(port) = self.base.port() {
            host = format!("{host}:{port}");
        }
        let prefix = self.base.path().trim_end_matches('/');
        if self.config.path_style {
            Target {
                scheme: self.base.scheme().to_string(),
                host,
                path: format!("{prefix}/{bucket}/{key}"),
            }
        } else {
            Target {
                scheme: self.base.scheme().to_string(),
                host: format!("{bucket}.{host}"),
                path: format!("{prefix}/{key}"),
            }
        }
    }

    /// Signs and sends one request; non-2xx answers become errors.
    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        checksum: Option<String>,
    ) -> Result<Response, TransferError> {
        let target = self.target(bucket, key);
        let mut request = SignableRequest::new(method.as_str(), &target.host, &target.path)
            .with_scheme(&target.scheme);
        request.query = query;
        if let Some(checksum) = &checksum {
            request = request.with_header(CHECKSUM_HEADER, checksum.as_str());
        }

        // Fresh snapshot and signature for every call.
        let credentials = self.credentials.credentials();
        let mut builder = match self.config.signing {
            SigningMode::Query => {
                let presigned =
                    self.signer
                        .presign(credentials.as_ref(), &request, self.config.presign_expiry)?;
                self.http.request(method.clone(), presigned.url.as_str())
            }
            SigningMode::Header => {
                let payload_hash = sha256_hex(body.as_deref().unwrap_or_default());
                let signed =
                    self.signer
                        .sign_headers(credentials.as_ref(), &request, &payload_hash)?;
                let mut url = format!("{}://{}{}", target.scheme, target.host, encode_path(&target.path));
                if !request.query.is_empty() {
                    url.push('?');
                    url.push_str(&canonical_query(&request.query));
                }
                let mut builder = self.http.request(method.clone(), url.as_str());
                for (name, value) in signed.headers() {
                    builder = builder.header(name, value);
                }
                builder
            }
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(|e| self.map_transport(e))?;
        let status = resp.status();
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = resp.text().await.map_err(|e| self.map_transport(e))?;

        debug!(%method, bucket, key, status = status.as_u16(), "store request finished");

        if !status.is_success() {
            return Err(map_error_response(status, &body, bucket, key));
        }
        Ok(Response {
            status,
            etag,
            content_length,
            body,
        })
    }

    fn map_transport(&self, err: reqwest::Error) -> TransferError {
        if err.is_timeout() {
            TransferError::Timeout(self.config.request_timeout)
        } else {
            TransferError::Network(err.to_string())
        }
    }
}

/// Maps a non-success answer to the transfer error taxonomy.
fn map_error_response(status: StatusCode, body: &str, bucket: &str, key: &str) -> TransferError {
    let Some(err) = xml::parse_error(body) else {
        return match status {
            StatusCode::UNAUTHORIZED => TransferError::Authentication(status.to_string()),
            StatusCode::FORBIDDEN => TransferError::AccessDenied(format!("{bucket}/{key}")),
            _ => TransferError::Http {
                status: status.as_u16(),
                code: status.canonical_reason().unwrap_or("Unknown").to_string(),
                message: body.chars().take(200).collect(),
            },
        };
    };
    match err.code.as_str() {
        "AccessDenied" | "AllAccessDisabled" => TransferError::AccessDenied(err.message),
        "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" | "InvalidToken"
        | "TokenRefreshRequired" => TransferError::Authentication(format!("{}: {}", err.code, err.message)),
        "NoSuchBucket" => TransferError::BucketNotFound(bucket.to_string()),
        "NoSuchUpload" => TransferError::NoSuchUpload(err.message),
        "KeyTooLongError" => TransferError::KeyTooLong(key.len()),
        "BadDigest" | "InvalidDigest" | "XAmzContentSHA256Mismatch" => {
            TransferError::ChecksumMismatch(err.message)
        }
        "InvalidPart" | "InvalidPartOrder" | "EntityTooSmall" => {
            TransferError::MultipartUploadFailed(format!("{}: {}", err.code, err.message))
        }
        _ => TransferError::Http {
            status: status.as_u16(),
            code: err.code,
            message: err.message,
        },
    }
}

fn require_etag(resp: &Response) -> Result<String, TransferError> {
    resp.etag
        .clone()
        .ok_or_else(|| TransferError::InvalidResponse(format!("{} without ETag", resp.status)))
}

fn upload_query(upload_id: &str) -> Vec<(String, String)> {
    vec![("uploadId".to_string(), upload_id.to_string())]
}

impl ObjectStore for HttpObjectStore {
    fn head_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> StoreFuture<'a, Option<ObjectMeta>> {
        Box::pin(async move {
            match self.send(Method::HEAD, bucket, key, Vec::new(), None, None).await {
                Ok(resp) => Ok(Some(ObjectMeta {
                    size: resp.content_length.unwrap_or_default(),
                    etag: resp.etag,
                })),
                Err(TransferError::Http { status: 404, .. }) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        body: Vec<u8>,
        checksum: Option<String>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let resp = self
                .send(Method::PUT, bucket, key, Vec::new(), Some(body), checksum)
                .await?;
            require_etag(&resp)
        })
    }

    fn create_multipart<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let query = vec![("uploads".to_string(), String::new())];
            let resp = self.send(Method::POST, bucket, key, query, None, None).await?;
            xml::parse_upload_id(&resp.body)
        })
    }

    fn upload_part<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
        checksum: Option<String>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut query = upload_query(upload_id);
            query.push(("partNumber".to_string(), part_number.to_string()));
            let resp = self
                .send(Method::PUT, bucket, key, query, Some(body), checksum)
                .await?;
            require_etag(&resp)
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let body = xml::complete_body(parts)?;
            let resp = self
                .send(
                    Method::POST,
                    bucket,
                    key,
                    upload_query(upload_id),
                    Some(body.into_bytes()),
                    None,
                )
                .await?;
            // A 200 answer may still carry an error document.
            if xml::parse_error(&resp.body).is_some() {
                return Err(map_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &resp.body,
                    bucket,
                    key,
                ));
            }
            xml::parse_complete_etag(&resp.body)
        })
    }

    fn abort_multipart<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match self
                .send(Method::DELETE, bucket, key, upload_query(upload_id), None, None)
                .await
            {
                Ok(_) => Ok(()),
                Err(TransferError::NoSuchUpload(_)) => {
                    warn!(bucket, key, upload_id, "abort: upload already gone");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }
}
