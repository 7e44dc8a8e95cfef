//! In-process cluster for coordinator tests.
//!
//! Every node is a real [`NodeController`] working on its own directories
//! under a temp dir. The connector in front of them records each control
//! call and can inject failures per node.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use br_agent::fs::walker::{walk_directory, WalkOptions};
use br_agent::node::NodeController;
use br_agent::protocol::{
    BeginAck, BeginRequest, CommitAck, DownloadAck, DownloadRequest, LoadAck, LoadRequest,
    NodeRole, SnapshotRef, StageAck, StageRequest, UploadAck, UploadRequest,
};
use br_agent::AgentError;

use crate::config::{BackupConfig, NodeInfo, RestoreConfig};
use crate::registry::{NodeConnector, NodeError, NodeSession, NodeTarget};
use crate::settings::Settings;
use crate::transport::LocalBackend;

#[derive(Debug, Clone)]
pub enum Fault {
    /// Connect fails as unreachable for the first `n` attempts.
    UnreachableTimes(u32),
    Unreachable,
    RejectAuth,
    FailBegin,
    FailCommit,
    FailUpload,
    FailDownload,
    FailStage,
    FailLoad,
    DelayBegin(Duration),
}

pub fn test_settings() -> Settings {
    Settings {
        fan_out: 4,
        call_timeout: Duration::from_secs(10),
        connect_timeout: Duration::from_secs(2),
        connect_retries: 1,
        retry_backoff: Duration::from_millis(1),
        transfer_timeout: Duration::from_secs(30),
        ..Settings::default()
    }
}

pub fn storage_info(root: &str, addrs: &str) -> NodeInfo {
    let root = PathBuf::from(root);
    NodeInfo {
        addrs: addrs.to_string(),
        data: root.join("data"),
        root,
        user: "root".to_string(),
    }
}

pub fn backend_url(dir: &Path) -> String {
    format!("local://{}", dir.display())
}

#[derive(Default)]
struct Shared {
    faults: HashMap<String, Vec<Fault>>,
    attempts: HashMap<String, u32>,
    calls: HashMap<String, Vec<&'static str>>,
}

struct Node {
    key: String,
    info: NodeInfo,
    controller: Arc<NodeController>,
}

pub struct Cluster {
    _dir: TempDir,
    meta: Vec<NodeInfo>,
    storage: Vec<NodeInfo>,
    nodes: Arc<HashMap<String, Node>>,
    shared: Arc<Mutex<Shared>>,
}

impl Cluster {
    pub fn new(meta: usize, storage: usize) -> Self {
        Self::with_name("cluster", meta, storage)
    }

    /// Node addresses look like `storage-1.<name>:9000`, so clusters with
    /// different names never share an address.
    pub fn with_name(name: &str, meta: usize, storage: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let mut nodes = HashMap::new();
        let mut metas = Vec::new();
        let mut storages = Vec::new();

        for (role, count) in [(NodeRole::Meta, meta), (NodeRole::Storage, storage)] {
            for index in 0..count {
                let key = format!("{}-{}", role, index);
                let root = dir.path().join(&key);
                let info = NodeInfo {
                    addrs: format!("{}.{}:9000", key, name),
                    data: root.join("data"),
                    root,
                    user: "root".to_string(),
                };
                seed(&info.data, role, index);
                match role {
                    NodeRole::Meta => metas.push(info.clone()),
                    NodeRole::Storage => storages.push(info.clone()),
                }
                nodes.insert(
                    info.addrs.clone(),
                    Node {
                        key,
                        info,
                        controller: Arc::new(NodeController::new()),
                    },
                );
            }
        }

        Self {
            _dir: dir,
            meta: metas,
            storage: storages,
            nodes: Arc::new(nodes),
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    pub fn connector(&self) -> Arc<dyn NodeConnector> {
        Arc::new(TestConnector {
            nodes: self.nodes.clone(),
            shared: self.shared.clone(),
        })
    }

    pub fn inject(&self, key: &str, fault: Fault) {
        let mut shared = self.shared.lock().unwrap();
        shared.faults.entry(key.to_string()).or_default().push(fault);
    }

    pub fn clear_faults(&self) {
        self.shared.lock().unwrap().faults.clear();
    }

    pub fn connect_attempts(&self, key: &str) -> u32 {
        let shared = self.shared.lock().unwrap();
        shared.attempts.get(key).copied().unwrap_or(0)
    }

    pub fn calls(&self, key: &str) -> Vec<&'static str> {
        let shared = self.shared.lock().unwrap();
        shared.calls.get(key).cloned().unwrap_or_default()
    }

    pub fn reset_calls(&self) {
        self.shared.lock().unwrap().calls.clear();
    }

    pub fn meta_infos(&self) -> Vec<NodeInfo> {
        self.meta.clone()
    }

    pub fn storage_infos(&self) -> Vec<NodeInfo> {
        self.storage.clone()
    }

    pub fn meta_targets(&self) -> Vec<NodeTarget> {
        NodeTarget::from_config(NodeRole::Meta, &self.meta)
    }

    pub fn storage_targets(&self) -> Vec<NodeTarget> {
        NodeTarget::from_config(NodeRole::Storage, &self.storage)
    }

    /// Node keys, meta first.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.nodes.values().map(|n| n.key.clone()).collect();
        keys.sort();
        keys
    }

    fn node(&self, key: &str) -> &Node {
        self.nodes
            .values()
            .find(|n| n.key == key)
            .unwrap_or_else(|| panic!("no node {key}"))
    }

    pub fn root_dir(&self, key: &str) -> PathBuf {
        self.node(key).info.root.clone()
    }

    pub fn data_dir(&self, key: &str) -> PathBuf {
        self.node(key).info.data.clone()
    }

    /// Every visible file under the node's data dir with its contents.
    pub fn data_files(&self, key: &str) -> BTreeMap<String, Vec<u8>> {
        walk_directory(&self.data_dir(key), &WalkOptions::default())
            .unwrap()
            .into_iter()
            .map(|f| {
                let content = std::fs::read(&f.path).unwrap();
                (f.relative_key().to_string(), content)
            })
            .collect()
    }

    pub async fn all_idle(&self) -> bool {
        for node in self.nodes.values() {
            if node.controller.describe().await.is_some() {
                return false;
            }
        }
        true
    }

    pub fn backup_config(&self, backend: &str, spaces: &[&str]) -> BackupConfig {
        BackupConfig {
            meta_nodes: self.meta_infos(),
            storage_nodes: self.storage_infos(),
            space_names: spaces.iter().map(|s| s.to_string()).collect(),
            backend: backend.to_string(),
        }
    }

    pub fn restore_config(&self, backend: &str, name: &str) -> RestoreConfig {
        RestoreConfig {
            meta_nodes: self.meta_infos(),
            storage_nodes: self.storage_infos(),
            backend: backend.to_string(),
            backup_name: name.to_string(),
        }
    }

    pub fn backend(&self, dir: &Path) -> LocalBackend {
        LocalBackend::new(&backend_url(dir), dir.to_path_buf())
    }
}

/// Meta nodes hold the users table and one schema file per space; storage
/// node `i` holds one partition of each space.
fn seed(data: &Path, role: NodeRole, index: usize) {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    match role {
        NodeRole::Meta => {
            files.push(("users.tbl".into(), b"root:admin\n".to_vec()));
            files.push(("nba/schema".into(), b"player(name string, age int)".to_vec()));
            files.push(("basketball/schema".into(), b"team(name string)".to_vec()));
        }
        NodeRole::Storage => {
            for space in ["nba", "basketball"] {
                let rows = format!("{} rows held by storage {}\n", space, index).repeat(200);
                files.push((format!("{}/part-{}/000001.sst", space, index), rows.into_bytes()));
            }
        }
    }
    for (rel, content) in files {
        let path = data.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

struct TestConnector {
    nodes: Arc<HashMap<String, Node>>,
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl NodeConnector for TestConnector {
    async fn connect(&self, target: &NodeTarget) -> Result<Arc<dyn NodeSession>, NodeError> {
        let Some(node) = self.nodes.get(&target.info.addrs) else {
            return Err(NodeError::Unreachable(format!("unknown host {}", target.info.addrs)));
        };

        let (attempt, faults) = {
            let mut shared = self.shared.lock().unwrap();
            let attempt = shared.attempts.entry(node.key.clone()).or_default();
            *attempt += 1;
            let attempt = *attempt;
            (attempt, shared.faults.get(&node.key).cloned().unwrap_or_default())
        };
        for fault in faults {
            match fault {
                Fault::UnreachableTimes(n) if attempt <= n => {
                    return Err(NodeError::Unreachable(format!("{} refused connection", target.info.addrs)))
                }
                Fault::Unreachable => {
                    return Err(NodeError::Unreachable(format!("{} refused connection", target.info.addrs)))
                }
                Fault::RejectAuth => {
                    return Err(NodeError::AuthRejected(format!("user {} is not allowed", target.info.user)))
                }
                _ => {}
            }
        }

        Ok(Arc::new(TestSession {
            key: node.key.clone(),
            controller: node.controller.clone(),
            shared: self.shared.clone(),
        }))
    }
}

struct TestSession {
    key: String,
    controller: Arc<NodeController>,
    shared: Arc<Mutex<Shared>>,
}

impl TestSession {
    /// Log the call and return the faults currently injected for this node.
    fn record(&self, call: &'static str) -> Vec<Fault> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.entry(self.key.clone()).or_default().push(call);
        shared.faults.get(&self.key).cloned().unwrap_or_default()
    }

    fn injected(&self, faults: &[Fault], wanted: fn(&Fault) -> bool) -> Result<(), NodeError> {
        if faults.iter().any(wanted) {
            return Err(NodeError::Rejected {
                status: 500,
                message: format!("injected failure on {}", self.key),
            });
        }
        Ok(())
    }
}

fn node_error(e: AgentError) -> NodeError {
    match e {
        AgentError::Authentication(m) => NodeError::AuthRejected(m),
        AgentError::Busy(_) | AgentError::TokenMismatch { .. } => NodeError::Busy(e.to_string()),
        other => NodeError::Rejected {
            status: other.status().as_u16(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl NodeSession for TestSession {
    async fn begin(&self, req: BeginRequest) -> Result<BeginAck, NodeError> {
        let faults = self.record("begin");
        self.injected(&faults, |f| matches!(f, Fault::FailBegin))?;
        for fault in &faults {
            if let Fault::DelayBegin(delay) = fault {
                tokio::time::sleep(*delay).await;
            }
        }
        self.controller.begin(req).await.map_err(node_error)
    }

    async fn commit(&self, req: SnapshotRef) -> Result<CommitAck, NodeError> {
        let faults = self.record("commit");
        self.injected(&faults, |f| matches!(f, Fault::FailCommit))?;
        self.controller.commit(req).await.map_err(node_error)
    }

    async fn abort(&self, req: SnapshotRef) -> Result<(), NodeError> {
        self.record("abort");
        self.controller.abort(req).await.map_err(node_error)
    }

    async fn release(&self, req: SnapshotRef) -> Result<(), NodeError> {
        self.record("release");
        self.controller.release(req).await.map_err(node_error)
    }

    async fn upload(&self, req: UploadRequest) -> Result<UploadAck, NodeError> {
        let faults = self.record("upload");
        self.injected(&faults, |f| matches!(f, Fault::FailUpload))?;
        self.controller.upload(req).await.map_err(node_error)
    }

    async fn download(&self, req: DownloadRequest) -> Result<DownloadAck, NodeError> {
        let faults = self.record("download");
        self.injected(&faults, |f| matches!(f, Fault::FailDownload))?;
        self.controller.download(req).await.map_err(node_error)
    }

    async fn stage(&self, req: StageRequest) -> Result<StageAck, NodeError> {
        let faults = self.record("stage");
        self.injected(&faults, |f| matches!(f, Fault::FailStage))?;
        self.controller.stage(req).await.map_err(node_error)
    }

    async fn load(&self, req: LoadRequest) -> Result<LoadAck, NodeError> {
        let faults = self.record("load");
        self.injected(&faults, |f| matches!(f, Fault::FailLoad))?;
        self.controller.load(req).await.map_err(node_error)
    }
}
