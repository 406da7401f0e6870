//! Control client (shell side).

use std::net::SocketAddr;
use std::path::Path;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use uplift_protocol::{ControlRequest, ControlResponse, HistoryRecord, JobId, JobSummary, StatusSummary};

use crate::error::ControlError;
use crate::{CONNECT_TIMEOUT, frame_codec};

#[derive(Deserialize)]
struct Enqueued {
    id: JobId,
}

#[derive(Deserialize)]
struct JobList {
    jobs: Vec<JobSummary>,
}

#[derive(Deserialize)]
struct Records {
    records: Vec<HistoryRecord>,
}

/// One connection to a [`ControlServer`](crate::ControlServer).
pub struct ControlClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl ControlClient {
    /// Connects to the server at `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ControlError> {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ControlError::Timeout),
        };
        debug!(%addr, "control client connected");
        Ok(Self {
            framed: Framed::new(stream, frame_codec()),
        })
    }

    /// Sends `request` and waits for its response.
    pub async fn send(&mut self, request: &ControlRequest) -> Result<ControlResponse, ControlError> {
        let body = serde_json::to_vec(request)?;
        self.framed.send(Bytes::from(body)).await?;
        match self.framed.next().await {
            Some(frame) => Ok(serde_json::from_slice(&frame?)?),
            None => Err(ControlError::Closed),
        }
    }

    /// Sends `request` and decodes the reply data as `T`.
    ///
    /// A `success: false` reply becomes [`ControlError::Rejected`].
    pub async fn call<T: DeserializeOwned>(&mut self, request: ControlRequest) -> Result<T, ControlError> {
        let response = self.send(&request).await?;
        if !response.success {
            return Err(ControlError::Rejected(
                response.error.unwrap_or_else(|| "no error message".into()),
            ));
        }
        let data = Value::Object(response.data.unwrap_or_default());
        Ok(serde_json::from_value(data)?)
    }

    pub async fn status(&mut self) -> Result<StatusSummary, ControlError> {
        self.call(ControlRequest::new("status")).await
    }

    /// Queues `path` under the server's default bucket and key prefix.
    pub async fn upload(&mut self, path: &Path) -> Result<JobId, ControlError> {
        let request =
            ControlRequest::new("upload").with_arg("path", path.to_string_lossy().into_owned());
        let reply: Enqueued = self.call(request).await?;
        Ok(reply.id)
    }

    pub async fn list(&mut self) -> Result<Vec<JobSummary>, ControlError> {
        let reply: JobList = self.call(ControlRequest::new("list")).await?;
        Ok(reply.jobs)
    }

    /// Up to `limit` finished jobs, newest first.
    pub async fn history(&mut self, limit: usize) -> Result<Vec<HistoryRecord>, ControlError> {
        let request = ControlRequest::new("history").with_arg("limit", limit);
        let reply: Records = self.call(request).await?;
        Ok(reply.records)
    }
}
