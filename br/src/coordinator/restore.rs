//! Restore coordinator: puts a published backup back onto a cluster.
//!
//! Every target first downloads its assigned artifacts from the backend into
//! its own staging area. Nothing on a node changes until every download
//! verified; then meta nodes stage and load,
//! followed by storage nodes. A restore is not atomic across nodes: nodes
//! that already loaded keep the restored data if a later step fails, and the
//! returned report says which ones did.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use br_agent::protocol::{DownloadAck, DownloadRequest, LoadRequest, NodeRole, SnapshotRef, StageRequest};

use super::{resolve_mandatory, run_phase, PhaseLimits};
use crate::config::RestoreConfig;
use crate::error::{BrError, Phase, RestoreReport, Result};
use crate::manifest::{BackupManifest, NodeArtifact};
use crate::registry::{NodeConnector, NodeRegistry, NodeTarget, ResolvedNode};
use crate::settings::Settings;
use crate::transport::Transporter;

/// How backed-up nodes are matched to the nodes being restored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MappingPolicy {
    /// Source node `i` goes to target `i`. The cluster must have as many
    /// nodes as were configured at backup time, skipped ones included.
    #[default]
    Positional,
    /// Source `i` goes to target `i mod n`.
    RoundRobin,
    /// Source address to target address, per role.
    Explicit(HashMap<String, String>),
}

impl MappingPolicy {
    /// Build an explicit mapping from `SRC=DST` pairs.
    pub fn from_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Self> {
        let mut map = HashMap::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (src, dst) = pair
                .split_once('=')
                .filter(|(s, d)| !s.trim().is_empty() && !d.trim().is_empty())
                .ok_or_else(|| BrError::InvalidConfig(format!("mapping {:?} is not SRC=DST", pair)))?;
            if map.insert(src.trim().to_string(), dst.trim().to_string()).is_some() {
                return Err(BrError::InvalidConfig(format!("source {} is mapped twice", src.trim())));
            }
        }
        Ok(MappingPolicy::Explicit(map))
    }
}

/// For every target (same order as `targets`), the indices into `sources`
/// it receives. `configured` is the number of `role` nodes the backed-up
/// cluster had.
pub fn assign(
    role: NodeRole,
    sources: &[NodeArtifact],
    configured: usize,
    targets: &[NodeTarget],
    policy: &MappingPolicy,
) -> Result<Vec<Vec<usize>>> {
    let mut plan = vec![Vec::new(); targets.len()];
    if sources.is_empty() {
        return Ok(plan);
    }
    if targets.is_empty() {
        return Err(BrError::TopologyMismatch(format!(
            "backup has {} {} nodes but none are configured",
            sources.len(),
            role
        )));
    }

    match policy {
        MappingPolicy::Positional => {
            if configured != targets.len() {
                return Err(BrError::TopologyMismatch(format!(
                    "backup was taken from {} {} nodes, cluster has {}; use round-robin or an explicit mapping",
                    configured,
                    role,
                    targets.len()
                )));
            }
            for (i, source) in sources.iter().enumerate() {
                let slot = plan.get_mut(source.node.index).ok_or_else(|| {
                    BrError::TopologyMismatch(format!(
                        "backup names {} beyond the {} configured {} nodes",
                        source.node.key(),
                        configured,
                        role
                    ))
                })?;
                slot.push(i);
            }
        }
        MappingPolicy::RoundRobin => {
            for i in 0..sources.len() {
                plan[i % targets.len()].push(i);
            }
        }
        MappingPolicy::Explicit(map) => {
            for (i, source) in sources.iter().enumerate() {
                let dst = map.get(&source.node.addrs).ok_or_else(|| {
                    BrError::TopologyMismatch(format!(
                        "no mapping for {} node {}",
                        role, source.node.addrs
                    ))
                })?;
                let position = targets
                    .iter()
                    .position(|t| &t.info.addrs == dst)
                    .ok_or_else(|| {
                        BrError::TopologyMismatch(format!(
                            "{} is not a configured {} node",
                            dst, role
                        ))
                    })?;
                plan[position].push(i);
            }
        }
    }
    Ok(plan)
}

/// One target node and the artifacts assigned to it.
#[derive(Debug, Clone)]
struct RestoreJob {
    node: ResolvedNode,
    sources: Vec<NodeArtifact>,
}

impl RestoreJob {
    fn id(&self) -> String {
        self.node.id().to_string()
    }

    fn download_request(&self, name: &str, backend: &str) -> DownloadRequest {
        DownloadRequest {
            backup_name: name.to_string(),
            root_dir: self.node.target.info.root.clone(),
            data_dir: self.node.target.info.data.clone(),
            backend: backend.to_string(),
            artifacts: self.sources.iter().map(|s| s.artifact.clone()).collect(),
        }
    }

    /// The node must report one staged directory per assigned artifact and
    /// every file they list.
    fn check_download(&self, ack: &DownloadAck) -> std::result::Result<(), String> {
        let files: usize = self.sources.iter().map(|s| s.artifact.files.len()).sum();
        if ack.artifacts.len() != self.sources.len() || ack.files != files {
            return Err(format!(
                "staged {} artifacts with {} files, expected {} with {}",
                ack.artifacts.len(),
                ack.files,
                self.sources.len(),
                files
            ));
        }
        Ok(())
    }
}

pub struct RestoreCoordinator {
    registry: NodeRegistry,
    settings: Settings,
}

impl RestoreCoordinator {
    pub fn new(connector: Arc<dyn NodeConnector>, settings: Settings) -> Self {
        Self {
            registry: NodeRegistry::new(connector, &settings),
            settings,
        }
    }

    pub async fn restore_backup(
        &self,
        config: &RestoreConfig,
        policy: &MappingPolicy,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        config.validate()?;
        let transporter = Transporter::open(&config.backend, &self.settings.transfer_options())?;
        transporter.backend().check().await?;
        let manifest = BackupManifest::load(transporter.backend(), &config.backup_name).await?;
        info!(
            backup = %manifest.name,
            spaces = ?manifest.space_names,
            created_at = %manifest.created_at,
            "Restore started"
        );

        let meta_targets = NodeTarget::from_config(NodeRole::Meta, &config.meta_nodes);
        let storage_targets = NodeTarget::from_config(NodeRole::Storage, &config.storage_nodes);
        let meta_nodes = resolve_mandatory(&self.registry, &meta_targets, cancel).await?;
        let storage_nodes = resolve_mandatory(&self.registry, &storage_targets, cancel).await?;

        let meta_sources = manifest.nodes(NodeRole::Meta);
        let storage_sources = manifest.nodes(NodeRole::Storage);
        let meta_plan = assign(
            NodeRole::Meta,
            meta_sources,
            manifest.configured_count(NodeRole::Meta),
            &meta_targets,
            policy,
        )?;
        let storage_plan = assign(
            NodeRole::Storage,
            storage_sources,
            manifest.configured_count(NodeRole::Storage),
            &storage_targets,
            policy,
        )?;
        let meta_jobs = jobs(meta_nodes, &meta_plan, meta_sources);
        let storage_jobs = jobs(storage_nodes, &storage_plan, storage_sources);

        let mut run = RestoreRun {
            name: manifest.name.clone(),
            token: manifest.token.clone(),
            call: PhaseLimits {
                fan_out: self.settings.fan_out,
                timeout: self.settings.call_timeout,
            },
            transfer: PhaseLimits {
                fan_out: self.settings.fan_out,
                timeout: self.settings.transfer_timeout,
            },
            cancel,
            report: RestoreReport {
                backup_name: manifest.name.clone(),
                unloaded: meta_jobs
                    .iter()
                    .chain(storage_jobs.iter())
                    .map(|j| j.node.id().to_string())
                    .collect(),
                ..RestoreReport::default()
            },
            staged: HashMap::new(),
        };

        let all: Vec<RestoreJob> = meta_jobs.iter().chain(storage_jobs.iter()).cloned().collect();
        run.download(transporter.url(), &all).await?;
        run.stage_and_load(&meta_jobs, &all).await?;
        run.stage_and_load(&storage_jobs, &all).await?;

        info!(backup = %run.name, nodes = run.report.loaded.len(), "Restore finished");
        Ok(run.report)
    }
}

/// Pair each resolved target with its assigned sources. Targets that receive
/// nothing are left out.
fn jobs(nodes: Vec<ResolvedNode>, plan: &[Vec<usize>], sources: &[NodeArtifact]) -> Vec<RestoreJob> {
    nodes
        .into_iter()
        .zip(plan)
        .filter_map(|(node, assigned)| {
            if assigned.is_empty() {
                warn!(node = %node.id(), "No artifact assigned, node is left untouched");
                return None;
            }
            Some(RestoreJob {
                node,
                sources: assigned.iter().map(|&i| sources[i].clone()).collect(),
            })
        })
        .collect()
}

struct RestoreRun<'a> {
    name: String,
    token: String,
    call: PhaseLimits,
    transfer: PhaseLimits,
    cancel: &'a CancellationToken,
    report: RestoreReport,
    /// Staged artifact directories each node reported, by node id.
    staged: HashMap<String, Vec<PathBuf>>,
}

impl RestoreRun<'_> {
    /// Have every target fetch its assigned artifacts into its own
    /// staging area.
    async fn download(&mut self, backend: &str, jobs: &[RestoreJob]) -> Result<()> {
        let items: Vec<_> = jobs
            .iter()
            .map(|job| (job.node.session.clone(), job.download_request(&self.name, backend)))
            .collect();

        let results = run_phase(items, &self.transfer, self.cancel, |(session, req)| async move {
            session.download(req).await
        })
        .await;

        for (job, result) in jobs.iter().zip(results) {
            let outcome = result
                .map_err(|e| e.to_string())
                .and_then(|ack| job.check_download(&ack).map(|()| ack));
            match outcome {
                Ok(ack) => {
                    info!(node = %job.id(), files = ack.files, bytes = ack.bytes, "Artifacts downloaded");
                    self.staged.insert(job.id(), ack.artifacts);
                }
                Err(e) => self.report.errors.push((job.id(), format!("download: {}", e))),
            }
        }
        if !self.report.errors.is_empty() {
            return Err(self.fail(Phase::Download, jobs).await);
        }
        Ok(())
    }

    /// Stage then load one role's jobs.
    async fn stage_and_load(&mut self, jobs: &[RestoreJob], all: &[RestoreJob]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let items: Vec<_> = jobs
            .iter()
            .map(|job| {
                let req = StageRequest {
                    backup_name: self.name.clone(),
                    role: job.node.id().role,
                    root_dir: job.node.target.info.root.clone(),
                    data_dir: job.node.target.info.data.clone(),
                    artifacts: self.staged.get(&job.id()).cloned().unwrap_or_default(),
                };
                (job.node.session.clone(), req)
            })
            .collect();
        let results = run_phase(items, &self.call, self.cancel, |(session, req)| async move {
            session.stage(req).await
        })
        .await;
        for (job, result) in jobs.iter().zip(results) {
            if let Err(e) = result {
                self.report.errors.push((job.id(), format!("stage: {}", e)));
            }
        }
        if !self.report.errors.is_empty() {
            return Err(self.fail(Phase::Stage, all).await);
        }

        let request = LoadRequest {
            backup_name: self.name.clone(),
        };
        let items: Vec<_> = jobs
            .iter()
            .map(|job| (job.node.session.clone(), request.clone()))
            .collect();
        let results = run_phase(items, &self.call, self.cancel, |(session, req)| async move {
            session.load(req).await
        })
        .await;
        for (job, result) in jobs.iter().zip(results) {
            let id = job.node.id().to_string();
            match result {
                Ok(ack) => {
                    info!(node = %id, files = ack.files, previous = ?ack.previous_data_dir, "Node loaded");
                    self.report.unloaded.retain(|n| n != &id);
                    self.report.loaded.push(id);
                }
                Err(e) => self.report.errors.push((id, format!("load: {}", e))),
            }
        }
        if !self.report.errors.is_empty() {
            return Err(self.fail(Phase::Load, all).await);
        }
        Ok(())
    }

    /// Abort every node that has not loaded, which drops whatever it
    /// downloaded or staged, then report.
    async fn fail(&mut self, phase: Phase, jobs: &[RestoreJob]) -> BrError {
        self.report.failed_phase = Some(phase);
        let pending: Vec<&RestoreJob> = jobs
            .iter()
            .filter(|j| self.report.unloaded.contains(&j.id()))
            .collect();

        let snapshot = SnapshotRef {
            backup_name: self.name.clone(),
            token: self.token.clone(),
        };
        let items: Vec<_> = pending
            .iter()
            .map(|job| (job.node.session.clone(), snapshot.clone()))
            .collect();
        let results = run_phase(items, &self.call, &CancellationToken::new(), |(session, snapshot)| async move {
            session.abort(snapshot).await
        })
        .await;
        for (job, result) in pending.iter().zip(results) {
            if let Err(e) = result {
                warn!(node = %job.node.id(), backup = %self.name, "Failed to discard staged artifacts: {}", e);
            }
        }

        if self.cancel.is_cancelled() {
            warn!(backup = %self.name, "Restore cancelled: {}", self.report);
            return BrError::Cancelled;
        }
        error!(backup = %self.name, "Restore failed: {}", self.report);
        BrError::RestoreFailed(self.report.clone())
    }
}
