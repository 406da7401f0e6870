//! Control server (engine side).
//!
//! Listens on loopback, decodes one [`ControlRequest`] per frame and
//! answers with a [`ControlResponse`]. Connections are served
//! concurrently; requests on one connection are answered in order.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uplift_manager::{JobRequest, UploadManager};
use uplift_protocol::{ControlRequest, ControlResponse, JobId};

use crate::error::ControlError;
use crate::frame_codec;

/// Records returned by `history` when no limit is given.
const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Destination used by `upload` when the request names none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlDefaults {
    pub bucket: Option<String>,
    /// Prepended to the file name to form the object key.
    pub key_prefix: String,
}

impl ControlDefaults {
    /// Object key for `path` under the configured prefix.
    pub fn key_for(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let prefix = self.key_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            Some(name.to_string())
        } else {
            Some(format!("{prefix}/{name}"))
        }
    }
}

/// Translates control commands into [`UploadManager`] calls.
pub struct ControlServer {
    manager: UploadManager,
    defaults: ControlDefaults,
}

type Reply = Result<ControlResponse, String>;

impl ControlServer {
    pub fn new(manager: UploadManager, defaults: ControlDefaults) -> Self {
        Self { manager, defaults }
    }

    /// Binds the loopback listener. Port 0 picks an ephemeral port.
    pub async fn bind(port: u16) -> Result<TcpListener, ControlError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let port = listener.local_addr()?.port();
        info!(port, "control server bound");
        Ok(listener)
    }

    /// Accepts connections until `cancel` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ControlError> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("control server stopped");
                    return Ok(());
                }
                result = listener.accept() => result,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    continue;
                }
            };
            debug!(%peer, "control connection accepted");

            let server = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match server.connection(stream, peer, cancel).await {
                    Ok(()) => debug!(%peer, "control connection closed"),
                    Err(e) => warn!(%peer, error = %e, "control connection dropped"),
                }
            });
        }
    }

    async fn connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), ControlError> {
        let mut framed = Framed::new(stream, frame_codec());
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                frame = framed.next() => match frame {
                    Some(frame) => frame?,
                    None => return Ok(()),
                },
            };

            let response = match serde_json::from_slice::<ControlRequest>(&frame) {
                Ok(request) => self.handle(request).await,
                Err(e) => {
                    debug!(%peer, error = %e, "malformed control request");
                    ControlResponse::error(format!("Malformed request: {e}"))
                }
            };
            let body = serde_json::to_vec(&response)?;
            framed.send(Bytes::from(body)).await?;
        }
    }

    /// Executes one command.
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        debug!(command = %request.command, "control request");
        let outcome = match request.command.as_str() {
            "status" => self.status(),
            "upload" => self.upload(&request),
            "list" => reply(&json!({ "jobs": self.manager.list_jobs() })),
            "pause" => {
                self.manager.pause();
                self.status()
            }
            "resume" => {
                self.manager.resume();
                self.status()
            }
            "cancel" => self.cancel(&request).await,
            "retry" => self.retry(&request),
            "history" => self.history(&request),
            "bandwidth" => self.bandwidth(&request),
            other => Err(format!("Unknown command: {other}")),
        };
        outcome.unwrap_or_else(|message| {
            debug!(command = %request.command, error = %message, "control request rejected");
            ControlResponse::error(message)
        })
    }

    fn status(&self) -> Reply {
        reply(&self.manager.get_status())
    }

    fn upload(&self, request: &ControlRequest) -> Reply {
        let path = request
            .str_arg("path")
            .ok_or("Missing argument: path")?;
        let path = Path::new(path);
        let bucket = match request.str_arg("bucket") {
            Some(bucket) => bucket.to_string(),
            None => self
                .defaults
                .bucket
                .clone()
                .ok_or("No bucket given and no default bucket configured")?,
        };
        let key = match request.str_arg("key") {
            Some(key) => key.to_string(),
            None => self
                .defaults
                .key_for(path)
                .ok_or_else(|| format!("Cannot derive an object key from {}", path.display()))?,
        };

        let mut job = JobRequest::new(path, bucket, key);
        if let Some(hash) = request.str_arg("hash") {
            job = job.with_content_hash(hash);
        }
        let id = self.manager.enqueue(job).map_err(|e| e.to_string())?;
        reply(&json!({ "id": id }))
    }

    async fn cancel(&self, request: &ControlRequest) -> Reply {
        match request.str_arg("id") {
            Some(id) => {
                let id = parse_id(id)?;
                self.manager.cancel(id).await.map_err(|e| e.to_string())?;
                reply(&json!({ "cancelled": 1 }))
            }
            None => {
                let cancelled = self.manager.cancel_all().await;
                reply(&json!({ "cancelled": cancelled }))
            }
        }
    }

    fn retry(&self, request: &ControlRequest) -> Reply {
        let id = parse_id(request.str_arg("id").ok_or("Missing argument: id")?)?;
        self.manager.retry(id).map_err(|e| e.to_string())?;
        reply(&json!({ "id": id }))
    }

    fn history(&self, request: &ControlRequest) -> Reply {
        let limit = match request.arg("limit") {
            None => DEFAULT_HISTORY_LIMIT,
            Some(_) => request
                .u64_arg("limit")
                .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
                .ok_or("Invalid argument: limit")?,
        };
        reply(&json!({ "records": self.manager.history(limit) }))
    }

    fn bandwidth(&self, request: &ControlRequest) -> Reply {
        let bps = request
            .u64_arg("bytes_per_sec")
            .ok_or("Missing argument: bytes_per_sec")?;
        self.manager.set_bandwidth_limit(bps);
        reply(&json!({ "bytes_per_sec": bps }))
    }
}

fn parse_id(raw: &str) -> Result<JobId, String> {
    raw.parse().map_err(|_| format!("Invalid job id: {raw}"))
}

fn reply<T: Serialize>(data: &T) -> Reply {
    ControlResponse::ok(data).map_err(|e| format!("Cannot encode reply: {e}"))
}
