//! Snapshot coordinator: one point-in-time backup across every node.
//!
//! Phases run strictly in order: resolve, begin on meta nodes, begin on
//! storage nodes, commit everywhere, upload checkpoints, publish the
//! manifest, release checkpoints. A failure anywhere before publish aborts
//! every node that may hold snapshot state and removes the backup's objects,
//! so a manifest is only ever visible for a complete backup.

use std::ops::Range;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use br_agent::protocol::{
    is_valid_backup_name, BeginAck, BeginRequest, CommitAck, NodeRole, SnapshotRef, UploadAck,
    UploadRequest,
};

use super::{resolve_all, run_phase, Participant, ParticipantState, PhaseLimits};
use crate::config::BackupConfig;
use crate::error::{BrError, Phase, PhaseReport, Result};
use crate::manifest::{BackupManifest, NodeArtifact, NodeRecord};
use crate::registry::{NodeConnector, NodeRegistry, NodeTarget, ResolvedNode};
use crate::settings::Settings;
use crate::transport::{join_key, ArtifactRef, Transporter};

/// Object claiming a backup name while a run is in progress.
pub const LOCK_FILE: &str = ".br-lock";

pub fn lock_key(name: &str) -> String {
    join_key(name, LOCK_FILE)
}

/// `BACKUP_YYYY_MM_DD_HH_MM_SS` in UTC.
pub fn generate_backup_name() -> String {
    format!("BACKUP_{}", Utc::now().format("%Y_%m_%d_%H_%M_%S"))
}

pub struct SnapshotCoordinator {
    registry: NodeRegistry,
    settings: Settings,
}

impl SnapshotCoordinator {
    pub fn new(connector: Arc<dyn NodeConnector>, settings: Settings) -> Self {
        Self {
            registry: NodeRegistry::new(connector, &settings),
            settings,
        }
    }

    pub async fn create_backup(
        &self,
        config: &BackupConfig,
        cancel: &CancellationToken,
    ) -> Result<BackupManifest> {
        self.create_named_backup(config, &generate_backup_name(), cancel)
            .await
    }

    pub async fn create_named_backup(
        &self,
        config: &BackupConfig,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<BackupManifest> {
        config.validate()?;
        if !is_valid_backup_name(name) {
            return Err(BrError::InvalidConfig(format!("invalid backup name {:?}", name)));
        }

        let transporter = Transporter::open(&config.backend, &self.settings.transfer_options())?;
        transporter.backend().check().await?;
        claim_name(&transporter, name).await?;
        info!(backup = %name, backend = %config.backend, "Backup started");

        let result = self.run(config, name, &transporter, cancel).await;

        let backend = transporter.backend();
        match &result {
            Ok(manifest) => {
                if let Err(e) = backend.remove(&lock_key(name)).await {
                    warn!(backup = %name, "Failed to remove name lock: {}", e);
                }
                info!(
                    backup = %name,
                    meta = manifest.meta_nodes.len(),
                    storage = manifest.storage_nodes.len(),
                    spaces = ?manifest.space_names,
                    "Backup published"
                );
            }
            Err(e) => {
                error!(backup = %name, "Backup failed: {}", e);
                if let Err(e) = backend.remove(name).await {
                    warn!(backup = %name, "Failed to remove partial backup objects: {}", e);
                }
            }
        }
        result
    }

    async fn run(
        &self,
        config: &BackupConfig,
        name: &str,
        transporter: &Transporter,
        cancel: &CancellationToken,
    ) -> Result<BackupManifest> {
        let meta_targets = NodeTarget::from_config(NodeRole::Meta, &config.meta_nodes);
        let storage_targets = NodeTarget::from_config(NodeRole::Storage, &config.storage_nodes);

        let meta_nodes = super::resolve_mandatory(&self.registry, &meta_targets, cancel).await?;
        let (storage_nodes, skipped, warnings) = self.resolve_storage(&storage_targets, cancel).await?;

        let meta_count = meta_nodes.len();
        let mut run = SnapshotRun {
            name,
            token: Uuid::new_v4().to_string(),
            call: PhaseLimits {
                fan_out: self.settings.fan_out,
                timeout: self.settings.call_timeout,
            },
            transfer: PhaseLimits {
                fan_out: self.settings.fan_out,
                timeout: self.settings.transfer_timeout,
            },
            cancel,
            participants: meta_nodes
                .into_iter()
                .chain(storage_nodes)
                .map(Participant::new)
                .collect(),
        };
        let total = run.participants.len();
        info!(backup = %name, token = %run.token, meta = meta_count, storage = total - meta_count, "Nodes resolved");

        let meta_acks = run.begin(0..meta_count, &config.space_names).await?;
        let spaces = run.agree_on_spaces(&meta_acks).await?;
        info!(backup = %name, ?spaces, "Meta nodes begun, writes blocked");

        run.begin(meta_count..total, &spaces).await?;
        let commits = run.commit().await?;
        let artifacts = run.upload(transporter.url(), commits).await?;

        let mut meta = Vec::new();
        let mut storage = Vec::new();
        for (participant, artifact) in run.participants.iter().zip(artifacts) {
            let entry = NodeArtifact {
                node: NodeRecord::from_target(&participant.node.target),
                artifact,
            };
            match participant.id().role {
                NodeRole::Meta => meta.push(entry),
                NodeRole::Storage => storage.push(entry),
            }
        }
        let manifest = BackupManifest::new(
            name,
            &config.backend,
            &run.token,
            spaces,
            meta,
            storage,
            warnings,
        )
        .with_skipped(skipped);

        if let Err(e) = manifest.publish(transporter.backend()).await {
            run.abort_all().await;
            return Err(e);
        }
        run.release_all().await;
        Ok(manifest)
    }

    /// Resolve storage nodes, optionally skipping the unreachable ones.
    /// Skipped nodes are returned so the manifest keeps the full topology.
    async fn resolve_storage(
        &self,
        targets: &[NodeTarget],
        cancel: &CancellationToken,
    ) -> Result<(Vec<ResolvedNode>, Vec<NodeRecord>, Vec<String>)> {
        if !self.settings.tolerate_unreachable_storage {
            let nodes = super::resolve_mandatory(&self.registry, targets, cancel).await?;
            return Ok((nodes, Vec::new(), Vec::new()));
        }

        let mut nodes = Vec::new();
        let mut skipped = Vec::new();
        let mut warnings = Vec::new();
        let mut fatal = Vec::new();
        for (target, result) in resolve_all(&self.registry, targets, cancel).await? {
            match result {
                Ok(node) => nodes.push(node),
                Err(e) if e.is_transient() => {
                    warn!(node = %target.id, "Skipping unreachable storage node: {}", e);
                    skipped.push(NodeRecord::from_target(&target));
                    warnings.push(format!(
                        "{} was unreachable and is not part of this backup: {}",
                        target.id, e
                    ));
                }
                Err(e) => fatal.push((target, e)),
            }
        }
        if !fatal.is_empty() {
            return Err(super::resolve_error(fatal));
        }
        Ok((nodes, skipped, warnings))
    }
}

/// Claim `name` on the backend. Fails if another run holds it or a backup
/// with that name was already published.
async fn claim_name(transporter: &Transporter, name: &str) -> Result<()> {
    let backend = transporter.backend();
    let lock = serde_json::json!({
        "pid": std::process::id(),
        "started_at": Utc::now(),
    });
    let claimed = backend
        .create_exclusive(&lock_key(name), lock.to_string().into_bytes())
        .await?;
    if !claimed {
        return Err(BrError::NameConflict(name.to_string()));
    }
    if BackupManifest::exists(backend, name).await? {
        if let Err(e) = backend.remove(&lock_key(name)).await {
            warn!(backup = %name, "Failed to remove name lock: {}", e);
        }
        return Err(BrError::NameConflict(name.to_string()));
    }
    Ok(())
}

/// Check a node's upload ack against what it committed.
fn verify_upload(ack: UploadAck, key: &str, commit: &CommitAck) -> std::result::Result<ArtifactRef, String> {
    let artifact = ack.artifact;
    if artifact.key != key {
        return Err(format!("uploaded to {} instead of {}", artifact.key, key));
    }
    if artifact.files.is_empty() {
        return Err(format!("artifact {} holds no files", key));
    }
    if ArtifactRef::compute_digest(&artifact.files) != artifact.digest {
        return Err(format!("artifact {} digest does not match its file list", key));
    }
    if artifact.files.len() != commit.files {
        return Err(format!(
            "artifact {} holds {} files, checkpoint had {}",
            key,
            artifact.files.len(),
            commit.files
        ));
    }
    Ok(artifact)
}

/// State of one backup run. Lives only for the duration of the run.
struct SnapshotRun<'a> {
    name: &'a str,
    token: String,
    call: PhaseLimits,
    transfer: PhaseLimits,
    cancel: &'a CancellationToken,
    participants: Vec<Participant>,
}

impl SnapshotRun<'_> {
    fn snapshot_ref(&self) -> SnapshotRef {
        SnapshotRef {
            backup_name: self.name.to_string(),
            token: self.token.clone(),
        }
    }

    /// Abort everything, then turn a failed phase into the run's error.
    async fn fail(&mut self, report: PhaseReport) -> BrError {
        self.abort_all().await;
        if self.cancel.is_cancelled() {
            BrError::Cancelled
        } else {
            BrError::PartialFailure(report)
        }
    }

    async fn begin(&mut self, range: Range<usize>, spaces: &[String]) -> Result<Vec<BeginAck>> {
        let indices: Vec<usize> = range.collect();
        let items: Vec<_> = indices
            .iter()
            .map(|&i| {
                let node = &self.participants[i].node;
                let req = BeginRequest {
                    backup_name: self.name.to_string(),
                    token: self.token.clone(),
                    role: node.id().role,
                    spaces: spaces.to_vec(),
                    root_dir: node.target.info.root.clone(),
                    data_dir: node.target.info.data.clone(),
                };
                (node.session.clone(), req)
            })
            .collect();

        let results = run_phase(items, &self.call, self.cancel, |(session, req)| async move {
            session.begin(req).await
        })
        .await;

        let mut report = PhaseReport::new(Phase::Begin);
        let mut acks = Vec::with_capacity(indices.len());
        for (i, result) in indices.into_iter().zip(results) {
            let participant = &mut self.participants[i];
            let id = participant.id().to_string();
            match result {
                Ok(ack) if ack.token == self.token => {
                    participant.advance(ParticipantState::Begun);
                    report.succeeded.push(id);
                    acks.push(ack);
                }
                Ok(ack) => {
                    let message = format!("acknowledged token {} instead of {}", ack.token, self.token);
                    participant.advance(ParticipantState::Failed(message.clone()));
                    report.failed.push((id, message));
                }
                Err(e) => {
                    participant.advance(ParticipantState::Failed(e.to_string()));
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if !report.is_success() {
            return Err(self.fail(report).await);
        }
        Ok(acks)
    }

    /// Every meta node must report the same space set.
    async fn agree_on_spaces(&mut self, acks: &[BeginAck]) -> Result<Vec<String>> {
        let Some(first) = acks.first() else {
            return Err(BrError::Topology("no meta node acknowledged the snapshot".into()));
        };
        let mut report = PhaseReport::new(Phase::Begin);
        for (participant, ack) in self.participants.iter().zip(acks) {
            let id = participant.id().to_string();
            if ack.spaces == first.spaces {
                report.succeeded.push(id);
            } else {
                report.failed.push((
                    id,
                    format!("reported spaces {:?}, expected {:?}", ack.spaces, first.spaces),
                ));
            }
        }
        if !report.is_success() {
            return Err(self.fail(report).await);
        }
        Ok(first.spaces.clone())
    }

    /// Commit every participant. Returns each node's commit ack.
    async fn commit(&mut self) -> Result<Vec<CommitAck>> {
        let snapshot = self.snapshot_ref();
        let items: Vec<_> = self
            .participants
            .iter()
            .map(|p| (p.node.session.clone(), snapshot.clone()))
            .collect();

        let results = run_phase(items, &self.call, self.cancel, |(session, snapshot)| async move {
            session.commit(snapshot).await
        })
        .await;

        let mut report = PhaseReport::new(Phase::Commit);
        let mut checkpoints = Vec::with_capacity(results.len());
        for (participant, result) in self.participants.iter_mut().zip(results) {
            let id = participant.id().to_string();
            match result {
                Ok(ack) => {
                    participant.advance(ParticipantState::Committed);
                    info!(node = %id, files = ack.files, bytes = ack.bytes, "Snapshot committed");
                    report.succeeded.push(id);
                    checkpoints.push(ack);
                }
                Err(e) => {
                    participant.advance(ParticipantState::Failed(e.to_string()));
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if !report.is_success() {
            return Err(self.fail(report).await);
        }
        Ok(checkpoints)
    }

    /// Have every node push its committed checkpoint to
    /// `<name>/<node key>/` on the backend. The orchestrator never reads
    /// checkpoint files itself.
    async fn upload(&mut self, backend: &str, commits: Vec<CommitAck>) -> Result<Vec<ArtifactRef>> {
        let items: Vec<_> = self
            .participants
            .iter()
            .map(|p| {
                let req = UploadRequest {
                    backup_name: self.name.to_string(),
                    token: self.token.clone(),
                    backend: backend.to_string(),
                    key: join_key(self.name, &p.id().key()),
                };
                (p.node.session.clone(), req)
            })
            .collect();
        let keys: Vec<String> = items.iter().map(|(_, req)| req.key.clone()).collect();

        let results = run_phase(items, &self.transfer, self.cancel, |(session, req)| async move {
            session.upload(req).await
        })
        .await;

        let mut report = PhaseReport::new(Phase::Upload);
        let mut artifacts = Vec::with_capacity(results.len());
        for (((participant, result), commit), key) in
            self.participants.iter_mut().zip(results).zip(&commits).zip(&keys)
        {
            let id = participant.id().to_string();
            match result.map_err(|e| e.to_string()).and_then(|ack| verify_upload(ack, key, commit)) {
                Ok(artifact) => {
                    info!(node = %id, key = %artifact.key, files = artifact.files.len(), bytes = artifact.bytes, "Checkpoint uploaded");
                    report.succeeded.push(id);
                    artifacts.push(artifact);
                }
                Err(message) => {
                    participant.advance(ParticipantState::Failed(message.clone()));
                    report.failed.push((id, message));
                }
            }
        }

        if !report.is_success() {
            return Err(self.fail(report).await);
        }
        Ok(artifacts)
    }

    /// Send abort to every node that may hold snapshot state. Runs under its
    /// own cancellation scope so it still happens after the caller cancelled.
    async fn abort_all(&mut self) {
        let indices: Vec<usize> = (0..self.participants.len())
            .filter(|&i| self.participants[i].state().needs_abort())
            .collect();
        if indices.is_empty() {
            return;
        }
        let snapshot = self.snapshot_ref();
        let items: Vec<_> = indices
            .iter()
            .map(|&i| (self.participants[i].node.session.clone(), snapshot.clone()))
            .collect();

        let results = run_phase(items, &self.call, &CancellationToken::new(), |(session, snapshot)| async move {
            session.abort(snapshot).await
        })
        .await;

        for (i, result) in indices.into_iter().zip(results) {
            let participant = &mut self.participants[i];
            match result {
                Ok(()) => participant.advance(ParticipantState::Aborted),
                Err(e) => warn!(
                    node = %participant.id(),
                    backup = %self.name,
                    "Abort failed, run `br cleanup` for this backup: {}", e
                ),
            }
        }
    }

    /// Drop node checkpoints after publish. Failures only leave disk usage
    /// behind, so they are logged and otherwise ignored.
    async fn release_all(&mut self) {
        let snapshot = self.snapshot_ref();
        let items: Vec<_> = self
            .participants
            .iter()
            .map(|p| (p.node.session.clone(), snapshot.clone()))
            .collect();

        let results = run_phase(items, &self.call, &CancellationToken::new(), |(session, snapshot)| async move {
            session.release(snapshot).await
        })
        .await;

        for (participant, result) in self.participants.iter().zip(results) {
            if let Err(e) = result {
                warn!(node = %participant.id(), backup = %self.name, "Failed to release checkpoint: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{backend_url, test_settings, Cluster, Fault};
    use crate::transport::Backend;
    use br_agent::protocol::CHECKPOINT_INFO;
    use br_agent::transport::object_store::ObjectStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn coordinator(cluster: &Cluster) -> SnapshotCoordinator {
        SnapshotCoordinator::new(cluster.connector(), test_settings())
    }

    #[test]
    fn test_generated_name_format() {
        let name = generate_backup_name();
        assert!(name.starts_with("BACKUP_"));
        assert_eq!(name.len(), "BACKUP_2024_01_01_00_00_00".len());
        assert!(is_valid_backup_name(&name));
    }

    #[tokio::test]
    async fn test_full_backup_names_every_node() {
        let cluster = Cluster::new(2, 3);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);

        let manifest = coordinator(&cluster)
            .create_backup(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.meta_nodes.len(), 2);
        assert_eq!(manifest.storage_nodes.len(), 3);
        assert_eq!(manifest.space_names, vec!["basketball", "nba"]);
        assert!(manifest.warnings.is_empty());
        for (i, entry) in manifest.storage_nodes.iter().enumerate() {
            assert_eq!(entry.node.addrs, config.storage_nodes[i].addrs);
            assert_eq!(entry.artifact.key, format!("{}/storage-{}", manifest.name, i));
            assert_eq!(entry.artifact.files.len(), 3);
            assert!(entry.artifact.files.iter().any(|f| f.path == CHECKPOINT_INFO));
        }

        let published = BackupManifest::load(&cluster.backend(store.path()), &manifest.name)
            .await
            .unwrap();
        assert_eq!(published, manifest);
        assert!(!store.path().join(&manifest.name).join(LOCK_FILE).exists());

        assert!(cluster.all_idle().await);
        for key in cluster.keys() {
            assert!(!cluster.root_dir(&key).join("checkpoints").join(&manifest.name).exists());
            assert_eq!(cluster.calls(&key), vec!["begin", "commit", "upload", "release"]);
        }
    }

    #[tokio::test]
    async fn test_selected_spaces_only() {
        let cluster = Cluster::new(1, 2);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &["nba"]);

        let manifest = coordinator(&cluster)
            .create_named_backup(&config, "NBA_ONLY", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.name, "NBA_ONLY");
        assert_eq!(manifest.space_names, vec!["nba"]);
        let files: Vec<&str> = manifest.storage_nodes[1]
            .artifact
            .files
            .iter()
            .map(|f| f.path.as_str())
            .collect();
        assert_eq!(files, vec![CHECKPOINT_INFO, "nba/part-1/000001.sst"]);
    }

    #[tokio::test]
    async fn test_meta_begin_failure_aborts_acknowledged_nodes() {
        let cluster = Cluster::new(3, 2);
        cluster.inject("meta-1", Fault::FailBegin);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);

        let err = coordinator(&cluster)
            .create_named_backup(&config, "B1", &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            BrError::PartialFailure(report) => {
                assert_eq!(report.phase, Phase::Begin);
                assert_eq!(report.failed.len(), 1);
                assert!(report.failed[0].0.starts_with("meta[1]"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cluster.calls("meta-0").contains(&"abort"));
        assert!(cluster.calls("meta-2").contains(&"abort"));
        assert!(!cluster.calls("storage-0").contains(&"begin"));
        assert!(!store.path().join("B1").exists());
        assert!(cluster.all_idle().await);
    }

    #[tokio::test]
    async fn test_commit_failure_aborts_everyone() {
        let cluster = Cluster::new(1, 2);
        cluster.inject("storage-1", Fault::FailCommit);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);

        let err = coordinator(&cluster)
            .create_named_backup(&config, "B1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BrError::PartialFailure(ref r) if r.phase == Phase::Commit));
        for key in ["meta-0", "storage-0", "storage-1"] {
            assert!(cluster.calls(key).contains(&"abort"), "{key} was not aborted");
        }
        assert!(!store.path().join("B1").exists());
        assert!(cluster.all_idle().await);
    }

    #[tokio::test]
    async fn test_unknown_space_fails_begin() {
        let cluster = Cluster::new(1, 1);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &["nba", "ghost"]);

        let err = coordinator(&cluster)
            .create_named_backup(&config, "B1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrError::PartialFailure(ref r) if r.failed[0].1.contains("ghost")));
    }

    #[tokio::test]
    async fn test_concurrent_same_name_one_wins() {
        let cluster_a = Cluster::with_name("a", 1, 1);
        let cluster_b = Cluster::with_name("b", 1, 1);
        let store = TempDir::new().unwrap();
        let url = backend_url(store.path());
        let config_a = cluster_a.backup_config(&url, &[]);
        let config_b = cluster_b.backup_config(&url, &[]);
        let coord_a = coordinator(&cluster_a);
        let coord_b = coordinator(&cluster_b);
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            coord_a.create_named_backup(&config_a, "SAME", &cancel),
            coord_b.create_named_backup(&config_b, "SAME", &cancel),
        );

        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(BrError::NameConflict(_))))
                .count(),
            1
        );
        BackupManifest::load(&cluster_a.backend(store.path()), "SAME")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_published_name_is_a_conflict() {
        let cluster = Cluster::new(1, 1);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);
        let coord = coordinator(&cluster);
        let cancel = CancellationToken::new();

        coord.create_named_backup(&config, "B1", &cancel).await.unwrap();
        let err = coord.create_named_backup(&config, "B1", &cancel).await.unwrap_err();
        assert!(matches!(err, BrError::NameConflict(_)));
        BackupManifest::load(&cluster.backend(store.path()), "B1").await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_storage_is_fatal_by_default() {
        let cluster = Cluster::new(1, 2);
        cluster.inject("storage-1", Fault::Unreachable);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);

        let err = coordinator(&cluster)
            .create_named_backup(&config, "B1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrError::Topology(ref m) if m.contains("storage[1]")));
        assert!(cluster.calls("meta-0").is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_storage_can_be_tolerated() {
        let cluster = Cluster::new(1, 2);
        cluster.inject("storage-1", Fault::Unreachable);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);
        let settings = Settings {
            tolerate_unreachable_storage: true,
            ..test_settings()
        };

        let manifest = SnapshotCoordinator::new(cluster.connector(), settings)
            .create_named_backup(&config, "B1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(manifest.storage_nodes.len(), 1);
        assert_eq!(manifest.storage_nodes[0].node.index, 0);
        assert_eq!(manifest.warnings.len(), 1);
        assert!(manifest.warnings[0].contains("storage[1]"));
        assert_eq!(manifest.skipped_nodes.len(), 1);
        assert_eq!(manifest.skipped_nodes[0].key(), "storage-1");
        assert_eq!(manifest.configured_count(NodeRole::Storage), 2);
    }

    #[tokio::test]
    async fn test_meta_auth_rejection() {
        let cluster = Cluster::new(1, 1);
        cluster.inject("meta-0", Fault::RejectAuth);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);

        let err = coordinator(&cluster)
            .create_named_backup(&config, "B1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrError::AuthRejected { ref node, .. } if node.starts_with("meta[0]")));
        assert!(!store.path().join("B1").exists());
    }

    #[tokio::test]
    async fn test_cancel_aborts_contacted_nodes() {
        let cluster = Cluster::new(1, 2);
        cluster.inject("storage-1", Fault::DelayBegin(Duration::from_secs(30)));
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = coordinator(&cluster)
            .create_named_backup(&config, "B1", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BrError::Cancelled));
        assert!(cluster.calls("meta-0").contains(&"abort"));
        assert!(cluster.calls("storage-0").contains(&"abort"));
        assert!(cluster.all_idle().await);
        assert!(!store.path().join("B1").exists());
    }

    #[tokio::test]
    async fn test_backup_to_http_backend() {
        let cluster = Cluster::new(1, 2);
        let objects = ObjectStore::default();
        let url = objects.spawn().await.unwrap();
        let config = cluster.backup_config(&url, &[]);

        let manifest = coordinator(&cluster)
            .create_named_backup(&config, "B1", &CancellationToken::new())
            .await
            .unwrap();

        let backend = crate::transport::HttpBackend::new(&url, &test_settings().transfer_options()).unwrap();
        assert_eq!(BackupManifest::load(&backend, "B1").await.unwrap(), manifest);
        assert!(!backend.exists(&lock_key("B1")).await.unwrap());
        assert!(objects.objects.lock().await.contains_key("B1/storage-1/br_checkpoint.json"));
    }

    #[tokio::test]
    async fn test_upload_failure_leaves_nothing_behind() {
        let cluster = Cluster::new(1, 2);
        cluster.inject("storage-1", Fault::FailUpload);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);

        let err = coordinator(&cluster)
            .create_named_backup(&config, "B1", &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            BrError::PartialFailure(report) => {
                assert_eq!(report.phase, Phase::Upload);
                assert_eq!(report.failed.len(), 1);
                assert!(report.failed[0].0.starts_with("storage[1]"));
                assert_eq!(report.succeeded.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        for key in cluster.keys() {
            assert!(cluster.calls(&key).contains(&"abort"), "{key} was not aborted");
            assert!(!cluster.root_dir(&key).join("checkpoints").join("B1").exists());
        }
        assert!(!store.path().join("B1").exists());
        assert!(!BackupManifest::exists(&cluster.backend(store.path()), "B1").await.unwrap());
        assert!(cluster.all_idle().await);
    }

    #[tokio::test]
    async fn test_storage_begin_failure_aborts_begun_nodes() {
        let cluster = Cluster::new(1, 2);
        cluster.inject("storage-1", Fault::FailBegin);
        let store = TempDir::new().unwrap();
        let config = cluster.backup_config(&backend_url(store.path()), &[]);

        let err = coordinator(&cluster)
            .create_named_backup(&config, "B1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BrError::PartialFailure(ref r) if r.phase == Phase::Begin));
        assert!(cluster.calls("meta-0").contains(&"abort"));
        assert!(cluster.calls("storage-0").contains(&"abort"));
        for key in cluster.keys() {
            assert!(!cluster.calls(&key).contains(&"commit"));
        }
        assert!(!store.path().join("B1").exists());
        assert!(cluster.all_idle().await);
    }
}
