//! HTTP sessions against the `br-agent` control endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use br_agent::protocol::{
    BeginAck, BeginRequest, CommitAck, DownloadAck, DownloadRequest, ErrorBody, HealthResponse,
    LoadAck, LoadRequest, SnapshotRef, StageAck, StageRequest, UploadAck, UploadRequest,
    USER_HEADER,
};

use super::{NodeConnector, NodeError, NodeSession, NodeTarget};
use crate::settings::Settings;

pub struct HttpConnector {
    client: reqwest::Client,
    call_timeout: Duration,
    transfer_timeout: Duration,
}

impl HttpConnector {
    pub fn new(settings: &Settings) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.call_timeout)
            .build()
            .map_err(|e| NodeError::Protocol(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            call_timeout: settings.call_timeout,
            transfer_timeout: settings.transfer_timeout,
        })
    }
}

#[async_trait]
impl NodeConnector for HttpConnector {
    async fn connect(&self, target: &NodeTarget) -> Result<Arc<dyn NodeSession>, NodeError> {
        let session = HttpSession {
            client: self.client.clone(),
            base_url: format!("http://{}", target.info.addrs),
            user: target.info.user.clone(),
            call_timeout: self.call_timeout,
            transfer_timeout: self.transfer_timeout,
        };
        let health = session.health().await?;
        tracing::debug!(
            node = %target.id,
            version = %health.version,
            operation = ?health.operation,
            "Agent reachable"
        );
        Ok(Arc::new(session))
    }
}

pub struct HttpSession {
    client: reqwest::Client,
    base_url: String,
    user: String,
    call_timeout: Duration,
    /// Applies to upload and download, which move whole checkpoints.
    transfer_timeout: Duration,
}

impl HttpSession {
    pub async fn health(&self) -> Result<HealthResponse, NodeError> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .header(USER_HEADER, &self.user)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.call_timeout))?;
        decode(resp).await
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, NodeError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.post_within(path, body, self.call_timeout).await
    }

    async fn post_within<Req, Resp>(&self, path: &str, body: &Req, timeout: Duration) -> Result<Resp, NodeError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(USER_HEADER, &self.user)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;
        decode(resp).await
    }

    fn map_send_error(&self, e: reqwest::Error, timeout: Duration) -> NodeError {
        if e.is_timeout() {
            NodeError::Timeout(timeout)
        } else if e.is_connect() || e.is_request() {
            NodeError::Unreachable(format!("{}: {}", self.base_url, e))
        } else {
            NodeError::Protocol(e.to_string())
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, NodeError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .map_err(|e| NodeError::Protocol(format!("invalid response body: {}", e)));
    }

    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => NodeError::AuthRejected(message),
        StatusCode::CONFLICT => NodeError::Busy(message),
        _ => NodeError::Rejected {
            status: status.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl NodeSession for HttpSession {
    async fn begin(&self, req: BeginRequest) -> Result<BeginAck, NodeError> {
        self.post("/snapshot/begin", &req).await
    }

    async fn commit(&self, req: SnapshotRef) -> Result<CommitAck, NodeError> {
        self.post("/snapshot/commit", &req).await
    }

    async fn abort(&self, req: SnapshotRef) -> Result<(), NodeError> {
        let _: serde_json::Value = self.post("/snapshot/abort", &req).await?;
        Ok(())
    }

    async fn release(&self, req: SnapshotRef) -> Result<(), NodeError> {
        let _: serde_json::Value = self.post("/snapshot/release", &req).await?;
        Ok(())
    }

    async fn upload(&self, req: UploadRequest) -> Result<UploadAck, NodeError> {
        self.post_within("/snapshot/upload", &req, self.transfer_timeout).await
    }

    async fn download(&self, req: DownloadRequest) -> Result<DownloadAck, NodeError> {
        self.post_within("/restore/download", &req, self.transfer_timeout).await
    }

    async fn stage(&self, req: StageRequest) -> Result<StageAck, NodeError> {
        self.post("/restore/stage", &req).await
    }

    async fn load(&self, req: LoadRequest) -> Result<LoadAck, NodeError> {
        self.post("/restore/load", &req).await
    }
}
