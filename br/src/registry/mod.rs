//! NodeTarget registry: turns configured nodes into live control sessions.
//!
//! A session is a stateless handle to a node's control agent, so resolving a
//! node again is always safe. Transient failures (unreachable, timed out)
//! are retried with a linear backoff; a credential refusal never is.

pub mod http;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, warn};

use br_agent::protocol::{
    BeginAck, BeginRequest, CommitAck, DownloadAck, DownloadRequest, LoadAck, LoadRequest,
    NodeRole, SnapshotRef, StageAck, StageRequest, UploadAck, UploadRequest,
};

use crate::config::NodeInfo;
use crate::settings::Settings;

pub use http::{HttpConnector, HttpSession};

/// Identity of a node within one run: its role, its position in the
/// configured list and its address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub role: NodeRole,
    pub index: usize,
    pub addrs: String,
}

impl NodeId {
    /// Backend prefix for this node's artifact, e.g. `storage-2`.
    pub fn key(&self) -> String {
        format!("{}-{}", self.role, self.index)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.role, self.index, self.addrs)
    }
}

#[derive(Debug, Clone)]
pub struct NodeTarget {
    pub id: NodeId,
    pub info: NodeInfo,
}

impl NodeTarget {
    /// Targets for one role in configured order.
    pub fn from_config(role: NodeRole, nodes: &[NodeInfo]) -> Vec<NodeTarget> {
        nodes
            .iter()
            .enumerate()
            .map(|(index, info)| NodeTarget {
                id: NodeId {
                    role,
                    index,
                    addrs: info.addrs.clone(),
                },
                info: info.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("node busy: {0}")]
    Busy(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Unreachable(_) | NodeError::Timeout(_))
    }
}

/// Control calls a node accepts.
#[async_trait]
pub trait NodeSession: Send + Sync {
    async fn begin(&self, req: BeginRequest) -> Result<BeginAck, NodeError>;
    async fn commit(&self, req: SnapshotRef) -> Result<CommitAck, NodeError>;
    async fn abort(&self, req: SnapshotRef) -> Result<(), NodeError>;
    async fn release(&self, req: SnapshotRef) -> Result<(), NodeError>;
    /// Have the node push its committed checkpoint to the backend.
    async fn upload(&self, req: UploadRequest) -> Result<UploadAck, NodeError>;
    /// Have the node pull artifacts from the backend into its staging area.
    async fn download(&self, req: DownloadRequest) -> Result<DownloadAck, NodeError>;
    async fn stage(&self, req: StageRequest) -> Result<StageAck, NodeError>;
    async fn load(&self, req: LoadRequest) -> Result<LoadAck, NodeError>;
}

/// Opens sessions. `connect` must fail when the node cannot be reached or
/// refuses the configured user.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, target: &NodeTarget) -> Result<Arc<dyn NodeSession>, NodeError>;
}

/// A target paired with its live session.
#[derive(Clone)]
pub struct ResolvedNode {
    pub target: NodeTarget,
    pub session: Arc<dyn NodeSession>,
}

impl ResolvedNode {
    pub fn id(&self) -> &NodeId {
        &self.target.id
    }
}

impl fmt::Debug for ResolvedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedNode").field("id", &self.target.id).finish()
    }
}

pub struct NodeRegistry {
    connector: Arc<dyn NodeConnector>,
    connect_timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl NodeRegistry {
    pub fn new(connector: Arc<dyn NodeConnector>, settings: &Settings) -> Self {
        Self {
            connector,
            connect_timeout: settings.connect_timeout,
            retries: settings.connect_retries,
            backoff: settings.retry_backoff,
        }
    }

    pub async fn resolve(&self, target: &NodeTarget) -> Result<ResolvedNode, NodeError> {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.connect_timeout, self.connector.connect(target)).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout(self.connect_timeout)),
            };

            match result {
                Ok(session) => {
                    debug!(node = %target.id, attempt, "Node resolved");
                    return Ok(ResolvedNode {
                        target: target.clone(),
                        session,
                    });
                }
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(node = %target.id, attempt, "Resolve failed, retrying: {}", e);
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve every target concurrently, keeping configured order.
    pub async fn resolve_role(
        &self,
        targets: &[NodeTarget],
    ) -> Vec<(NodeTarget, Result<ResolvedNode, NodeError>)> {
        let results = join_all(targets.iter().map(|t| self.resolve(t))).await;
        targets.iter().cloned().zip(results).collect()
    }
}
