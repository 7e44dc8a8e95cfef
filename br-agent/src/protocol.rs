//! Wire types exchanged between the `br` orchestrator and the node agent.
//!
//! Every control endpoint takes and returns JSON. The caller identifies
//! itself with the [`USER_HEADER`] header.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::transport::ArtifactRef;

/// Header carrying the principal the orchestrator acts as.
pub const USER_HEADER: &str = "x-br-user";

/// Directory under a node's data dir where pulled artifacts wait for load.
pub const STAGING_DIR: &str = ".br-staging";

/// Directory under a node's root dir holding snapshot checkpoints.
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Directory under a node's root dir receiving the data replaced by a restore.
pub const PREVIOUS_DATA_DIR: &str = "restore-previous";

/// Descriptor written at the top of every checkpoint. Keeps an artifact
/// non-empty and lets a node refuse artifacts of the wrong backup or role.
pub const CHECKPOINT_INFO: &str = "br_checkpoint.json";

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Meta,
    Storage,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Meta => "meta",
            NodeRole::Storage => "storage",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// POST /snapshot/begin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginRequest {
    pub backup_name: String,
    /// Logical snapshot token shared by every participant of one backup.
    pub token: String,
    pub role: NodeRole,
    /// Spaces to capture. Empty asks a meta node for every space.
    #[serde(default)]
    pub spaces: Vec<String>,
    pub root_dir: PathBuf,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginAck {
    pub backup_name: String,
    pub token: String,
    /// Spaces the checkpoint covers, sorted.
    pub spaces: Vec<String>,
}

/// Body of commit, abort and release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub backup_name: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAck {
    pub backup_name: String,
    pub checkpoint_dir: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

/// Contents of [`CHECKPOINT_INFO`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub backup_name: String,
    pub role: NodeRole,
    pub spaces: Vec<String>,
}

/// POST /snapshot/upload: push the committed checkpoint to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub backup_name: String,
    pub token: String,
    /// Backend URL, e.g. `local:///mnt/backups`.
    pub backend: String,
    /// Object key prefix, `<backup_name>/<role>-<index>`.
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub backup_name: String,
    pub artifact: ArtifactRef,
}

/// POST /restore/download: pull artifacts into this node's staging area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub backup_name: String,
    pub root_dir: PathBuf,
    pub data_dir: PathBuf,
    pub backend: String,
    pub artifacts: Vec<ArtifactRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadAck {
    pub backup_name: String,
    /// Local directory of each artifact, in request order.
    pub artifacts: Vec<PathBuf>,
    pub files: usize,
    pub bytes: u64,
}

/// POST /restore/stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub backup_name: String,
    pub role: NodeRole,
    pub root_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Pulled artifact directories, each under `<data_dir>/.br-staging/<backup_name>/`.
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAck {
    pub backup_name: String,
    pub files: usize,
    pub bytes: u64,
}

/// POST /restore/load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub backup_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadAck {
    pub backup_name: String,
    pub files: usize,
    /// Where the data replaced by the restore was moved, if there was any.
    pub previous_data_dir: Option<PathBuf>,
}

/// GET /health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Description of the in-flight operation, if any.
    pub operation: Option<String>,
}

/// Error body returned with every non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Path of the staging directory for one backup on a node.
pub fn staging_root(data_dir: &Path, backup_name: &str) -> PathBuf {
    data_dir.join(STAGING_DIR).join(backup_name)
}

/// Path of the checkpoint directory for one backup on a node.
pub fn checkpoint_path(root_dir: &Path, backup_name: &str) -> PathBuf {
    root_dir.join(CHECKPOINT_DIR).join(backup_name)
}

/// Staging subdirectory for an artifact: the last segment of its key.
pub fn artifact_dir_name(key: &str) -> Option<&str> {
    key.rsplit('/')
        .find(|s| !s.is_empty())
        .filter(|s| *s != "." && *s != "..")
}

/// Describe why `root_dir` and `data_dir` cannot serve as a node layout.
///
/// Checkpoints and replaced data live under the root; neither may end up
/// inside the data directory, and the data directory may not sit inside
/// either of them.
pub fn layout_conflict(root_dir: &Path, data_dir: &Path) -> Option<String> {
    if root_dir == data_dir {
        return Some(format!("root and data are the same directory {}", data_dir.display()));
    }
    if root_dir.starts_with(data_dir) {
        return Some(format!(
            "root {} lies inside data {}",
            root_dir.display(),
            data_dir.display()
        ));
    }
    for reserved in [CHECKPOINT_DIR, PREVIOUS_DATA_DIR] {
        let dir = root_dir.join(reserved);
        if data_dir.starts_with(&dir) {
            return Some(format!("data {} lies inside {}", data_dir.display(), dir.display()));
        }
    }
    None
}

/// Backup names double as directory and object-key segments.
pub fn is_valid_backup_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}
