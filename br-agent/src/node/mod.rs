//! Node controller: the single in-flight snapshot or restore operation on
//! this node and the transitions the orchestrator drives it through.
//!
//! ```text
//! snapshot:  idle --begin--> begun --commit--> committed --upload--> uploaded --release--> idle
//!                              \                   /                    /
//!                               +------abort------+--------------------+-----------------> idle
//! restore:   idle --download--> downloaded --stage--> staged --load--> idle
//!                                   \                   /
//!                                    +------abort------+----------------------------------> idle
//! ```
//!
//! Checkpoint copies, transfers and loads run outside the slot lock. While
//! one runs, the slot shows a transitional phase (`beginning`, `uploading`,
//! `downloading`, `loading`): health checks keep answering and any other
//! transition is refused as busy. An abort during such a phase cancels the
//! work and returns once the node has settled.

pub mod checkpoint;
pub mod staging;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::protocol::{
    artifact_dir_name, checkpoint_path, is_valid_backup_name, layout_conflict, staging_root,
    BeginAck, BeginRequest, CheckpointInfo, CommitAck, DownloadAck, DownloadRequest, LoadAck,
    LoadRequest, NodeRole, SnapshotRef, StageAck, StageRequest, UploadAck, UploadRequest,
};
use crate::transport::{ArtifactRef, TransferOptions, Transporter};
use crate::utils::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotPhase {
    Beginning,
    Begun,
    Committed,
    Uploading,
    Uploaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestorePhase {
    Downloading,
    Downloaded,
    /// A download failed part way; staging holds partial data.
    Incomplete,
    Staged,
    Loading,
}

#[derive(Debug, Clone)]
struct SnapshotOp {
    token: String,
    role: NodeRole,
    spaces: Vec<String>,
    checkpoint_dir: PathBuf,
    files: usize,
    bytes: u64,
    phase: SnapshotPhase,
    artifact: Option<ArtifactRef>,
}

#[derive(Debug, Clone)]
struct RestoreOp {
    root_dir: PathBuf,
    data_dir: PathBuf,
    artifacts: Vec<PathBuf>,
    phase: RestorePhase,
}

#[derive(Debug, Clone)]
enum Kind {
    Snapshot(SnapshotOp),
    Restore(RestoreOp),
}

#[derive(Debug, Clone)]
struct Operation {
    backup_name: String,
    cancel: CancellationToken,
    kind: Kind,
}

impl Operation {
    fn in_progress(&self) -> bool {
        match &self.kind {
            Kind::Snapshot(s) => matches!(s.phase, SnapshotPhase::Beginning | SnapshotPhase::Uploading),
            Kind::Restore(r) => matches!(r.phase, RestorePhase::Downloading | RestorePhase::Loading),
        }
    }

    fn describe(&self) -> String {
        match &self.kind {
            Kind::Snapshot(op) => {
                let phase = match op.phase {
                    SnapshotPhase::Beginning => "beginning",
                    SnapshotPhase::Begun => "begun",
                    SnapshotPhase::Committed => "committed",
                    SnapshotPhase::Uploading => "uploading",
                    SnapshotPhase::Uploaded => "uploaded",
                };
                format!("snapshot {} ({}, {})", self.backup_name, op.role, phase)
            }
            Kind::Restore(op) => {
                let phase = match op.phase {
                    RestorePhase::Downloading => "downloading",
                    RestorePhase::Downloaded => "downloaded",
                    RestorePhase::Incomplete => "download incomplete",
                    RestorePhase::Staged => "staged",
                    RestorePhase::Loading => "loading",
                };
                format!("restore {} ({})", self.backup_name, phase)
            }
        }
    }

    /// Path holding everything this operation created on disk.
    fn scratch_dir(&self) -> PathBuf {
        match &self.kind {
            Kind::Snapshot(s) => s.checkpoint_dir.clone(),
            Kind::Restore(r) => staging_root(&r.data_dir, &self.backup_name),
        }
    }
}

/// The operation slot, shared with the background work it hands out.
#[derive(Default)]
struct Slot {
    current: Mutex<Option<Operation>>,
    /// Signalled whenever background work leaves a transitional phase.
    settled: Notify,
}

fn snapshot_mut(current: &mut Option<Operation>) -> Option<&mut SnapshotOp> {
    match current.as_mut().map(|op| &mut op.kind) {
        Some(Kind::Snapshot(s)) => Some(s),
        _ => None,
    }
}

fn restore_mut(current: &mut Option<Operation>) -> Option<&mut RestoreOp> {
    match current.as_mut().map(|op| &mut op.kind) {
        Some(Kind::Restore(r)) => Some(r),
        _ => None,
    }
}

enum Claim<T> {
    /// The request was already satisfied.
    Settled(T),
    /// The slot now shows a transitional phase; the caller runs the work.
    Claimed(CancellationToken),
}

/// Owns the node's operation slot. Writes are considered blocked while a
/// snapshot is begun.
pub struct NodeController {
    slot: Arc<Slot>,
    transfer: TransferOptions,
    started_at: Instant,
}

impl NodeController {
    pub fn new() -> Self {
        Self::with_transfer(TransferOptions::default())
    }

    pub fn with_transfer(transfer: TransferOptions) -> Self {
        Self {
            slot: Arc::new(Slot::default()),
            transfer,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Human-readable description of the in-flight operation.
    pub async fn describe(&self) -> Option<String> {
        self.slot.current.lock().await.as_ref().map(Operation::describe)
    }

    pub async fn begin(&self, req: BeginRequest) -> Result<BeginAck> {
        validate_backup_name(&req.backup_name)?;
        validate_layout(&req.root_dir, &req.data_dir)?;
        if req.token.is_empty() {
            return Err(AgentError::InvalidRequest("token must not be empty".into()));
        }
        if !req.data_dir.is_dir() {
            return Err(AgentError::InvalidRequest(format!(
                "data_dir {} does not exist",
                req.data_dir.display()
            )));
        }

        match self.claim_begin(&req).await? {
            Claim::Settled(ack) => Ok(ack),
            Claim::Claimed(cancel) => tokio::spawn(capture(self.slot.clone(), req, cancel)).await?,
        }
    }

    async fn claim_begin(&self, req: &BeginRequest) -> Result<Claim<BeginAck>> {
        let mut current = self.slot.current.lock().await;
        if let Some(op) = current.as_ref() {
            if let Kind::Snapshot(s) = &op.kind {
                if op.backup_name == req.backup_name
                    && s.token == req.token
                    && s.phase != SnapshotPhase::Beginning
                {
                    return Ok(Claim::Settled(BeginAck {
                        backup_name: op.backup_name.clone(),
                        token: s.token.clone(),
                        spaces: s.spaces.clone(),
                    }));
                }
            }
            return Err(AgentError::Busy(op.describe()));
        }

        let cancel = CancellationToken::new();
        *current = Some(Operation {
            backup_name: req.backup_name.clone(),
            cancel: cancel.clone(),
            kind: Kind::Snapshot(SnapshotOp {
                token: req.token.clone(),
                role: req.role,
                spaces: req.spaces.clone(),
                checkpoint_dir: checkpoint_path(&req.root_dir, &req.backup_name),
                files: 0,
                bytes: 0,
                phase: SnapshotPhase::Beginning,
                artifact: None,
            }),
        });
        Ok(Claim::Claimed(cancel))
    }

    pub async fn commit(&self, req: SnapshotRef) -> Result<CommitAck> {
        let mut current = self.slot.current.lock().await;
        let op = match current.as_mut() {
            Some(op) if op.backup_name == req.backup_name => op,
            Some(other) => return Err(AgentError::Busy(other.describe())),
            None => return Err(AgentError::UnknownOperation(req.backup_name)),
        };
        let describe = op.describe();
        let Kind::Snapshot(snap) = &mut op.kind else {
            return Err(AgentError::Busy(describe));
        };
        check_token(&req.backup_name, &req.token, &snap.token)?;

        match snap.phase {
            SnapshotPhase::Beginning => return Err(AgentError::Busy(describe)),
            SnapshotPhase::Begun => {
                snap.phase = SnapshotPhase::Committed;
                info!(
                    backup = %req.backup_name,
                    files = snap.files,
                    bytes = snap.bytes,
                    "Snapshot committed, writes released"
                );
            }
            _ => {}
        }

        Ok(CommitAck {
            backup_name: req.backup_name,
            checkpoint_dir: snap.checkpoint_dir.clone(),
            files: snap.files,
            bytes: snap.bytes,
        })
    }

    /// Push the committed checkpoint to the backend under `req.key`.
    pub async fn upload(&self, req: UploadRequest) -> Result<UploadAck> {
        validate_backup_name(&req.backup_name)?;
        let transporter = Transporter::open(&req.backend, &self.transfer)?;

        let (dir, expected, cancel) = {
            let mut current = self.slot.current.lock().await;
            let op = match current.as_mut() {
                Some(op) if op.backup_name == req.backup_name => op,
                Some(other) => return Err(AgentError::Busy(other.describe())),
                None => return Err(AgentError::UnknownOperation(req.backup_name)),
            };
            let describe = op.describe();
            let cancel = op.cancel.clone();
            let Kind::Snapshot(snap) = &mut op.kind else {
                return Err(AgentError::Busy(describe));
            };
            check_token(&req.backup_name, &req.token, &snap.token)?;

            match (snap.phase, &snap.artifact) {
                (SnapshotPhase::Uploaded, Some(artifact)) if artifact.key == req.key => {
                    return Ok(UploadAck {
                        backup_name: req.backup_name,
                        artifact: artifact.clone(),
                    });
                }
                (SnapshotPhase::Committed | SnapshotPhase::Uploaded, _) => {}
                (SnapshotPhase::Begun, _) => {
                    return Err(AgentError::InvalidRequest(format!(
                        "snapshot {} is not committed",
                        req.backup_name
                    )))
                }
                _ => return Err(AgentError::Busy(describe)),
            }
            snap.phase = SnapshotPhase::Uploading;
            (snap.checkpoint_dir.clone(), snap.files, cancel)
        };

        tokio::spawn(ship(self.slot.clone(), transporter, req, dir, expected, cancel)).await?
    }

    /// Drop whatever this node holds for the backup. Succeeds when there is
    /// nothing to drop. Work in progress is cancelled and awaited first.
    pub async fn abort(&self, req: SnapshotRef) -> Result<()> {
        loop {
            let settled = self.slot.settled.notified();
            let mut current = self.slot.current.lock().await;
            match current.as_ref() {
                None => return Ok(()),
                Some(op) if op.backup_name != req.backup_name => {
                    warn!(backup = %req.backup_name, current = %op.describe(), "Abort for a different operation ignored");
                    return Ok(());
                }
                Some(op) if op.in_progress() => {
                    info!(operation = %op.describe(), "Cancelling work in progress");
                    op.cancel.cancel();
                    drop(current);
                    settled.await;
                    continue;
                }
                Some(_) => {}
            }

            if let Some(op) = current.take() {
                remove_dir(op.scratch_dir()).await?;
                info!(backup = %req.backup_name, "Operation aborted");
            }
            return Ok(());
        }
    }

    /// Drop a committed checkpoint once it has been uploaded.
    pub async fn release(&self, req: SnapshotRef) -> Result<()> {
        let mut current = self.slot.current.lock().await;
        match current.as_ref() {
            Some(op) if op.backup_name == req.backup_name => match &op.kind {
                Kind::Snapshot(s) => match s.phase {
                    SnapshotPhase::Committed | SnapshotPhase::Uploaded => {}
                    SnapshotPhase::Begun => {
                        return Err(AgentError::InvalidRequest(format!(
                            "snapshot {} is not committed",
                            req.backup_name
                        )))
                    }
                    _ => return Err(AgentError::Busy(op.describe())),
                },
                Kind::Restore(_) => return Ok(()),
            },
            _ => return Ok(()),
        }

        if let Some(op) = current.take() {
            remove_dir(op.scratch_dir()).await?;
            info!(backup = %req.backup_name, "Checkpoint released");
        }
        Ok(())
    }

    /// Pull artifacts from the backend into this node's staging area.
    pub async fn download(&self, req: DownloadRequest) -> Result<DownloadAck> {
        validate_backup_name(&req.backup_name)?;
        validate_layout(&req.root_dir, &req.data_dir)?;
        if req.artifacts.is_empty() {
            return Err(AgentError::InvalidRequest("no artifacts to download".into()));
        }
        let mut names = HashSet::new();
        for artifact in &req.artifacts {
            let name = artifact_dir_name(&artifact.key).ok_or_else(|| {
                AgentError::InvalidRequest(format!("invalid artifact key {:?}", artifact.key))
            })?;
            if !names.insert(name) {
                return Err(AgentError::InvalidRequest(format!(
                    "two artifacts would share staging directory {}",
                    name
                )));
            }
        }
        let transporter = Transporter::open(&req.backend, &self.transfer)?;

        let cancel = {
            let mut current = self.slot.current.lock().await;
            match current.as_ref() {
                None => {}
                Some(op) if op.backup_name == req.backup_name && !op.in_progress() => {
                    if !matches!(op.kind, Kind::Restore(_)) {
                        return Err(AgentError::Busy(op.describe()));
                    }
                }
                Some(op) => return Err(AgentError::Busy(op.describe())),
            }
            let cancel = current
                .as_ref()
                .map(|op| op.cancel.clone())
                .unwrap_or_default();
            *current = Some(Operation {
                backup_name: req.backup_name.clone(),
                cancel: cancel.clone(),
                kind: Kind::Restore(RestoreOp {
                    root_dir: req.root_dir.clone(),
                    data_dir: req.data_dir.clone(),
                    artifacts: Vec::new(),
                    phase: RestorePhase::Downloading,
                }),
            });
            cancel
        };

        tokio::spawn(fetch(self.slot.clone(), transporter, req, cancel)).await?
    }

    pub async fn stage(&self, req: StageRequest) -> Result<StageAck> {
        validate_backup_name(&req.backup_name)?;
        validate_layout(&req.root_dir, &req.data_dir)?;

        let mut current = self.slot.current.lock().await;
        let cancel = match current.as_ref() {
            None => CancellationToken::new(),
            Some(op) if op.backup_name == req.backup_name => match &op.kind {
                Kind::Restore(r) => match r.phase {
                    RestorePhase::Downloaded | RestorePhase::Staged => op.cancel.clone(),
                    RestorePhase::Incomplete => {
                        return Err(AgentError::InvalidRequest(format!(
                            "download of {} did not complete",
                            req.backup_name
                        )))
                    }
                    _ => return Err(AgentError::Busy(op.describe())),
                },
                Kind::Snapshot(_) => return Err(AgentError::Busy(op.describe())),
            },
            Some(op) => return Err(AgentError::Busy(op.describe())),
        };

        let data_dir = req.data_dir.clone();
        let name = req.backup_name.clone();
        let role = req.role;
        let artifacts = req.artifacts.clone();
        let (files, bytes) = tokio::task::spawn_blocking(move || {
            staging::validate_staged(&data_dir, &name, role, &artifacts)
        })
        .await??;

        info!(backup = %req.backup_name, artifacts = req.artifacts.len(), files, bytes, "Artifacts staged");

        *current = Some(Operation {
            backup_name: req.backup_name.clone(),
            cancel,
            kind: Kind::Restore(RestoreOp {
                root_dir: req.root_dir,
                data_dir: req.data_dir,
                artifacts: req.artifacts,
                phase: RestorePhase::Staged,
            }),
        });

        Ok(StageAck {
            backup_name: req.backup_name,
            files,
            bytes,
        })
    }

    pub async fn load(&self, req: LoadRequest) -> Result<LoadAck> {
        let restore = {
            let mut current = self.slot.current.lock().await;
            let op = match current.as_mut() {
                Some(op) if op.backup_name == req.backup_name => op,
                Some(other) => return Err(AgentError::Busy(other.describe())),
                None => return Err(AgentError::UnknownOperation(req.backup_name)),
            };
            let describe = op.describe();
            let Kind::Restore(restore) = &mut op.kind else {
                return Err(AgentError::Busy(describe));
            };
            match restore.phase {
                RestorePhase::Staged => {}
                RestorePhase::Downloading | RestorePhase::Loading => {
                    return Err(AgentError::Busy(describe))
                }
                _ => {
                    return Err(AgentError::InvalidRequest(format!(
                        "restore {} is not staged",
                        req.backup_name
                    )))
                }
            }
            restore.phase = RestorePhase::Loading;
            restore.clone()
        };

        tokio::spawn(swap_in(self.slot.clone(), req.backup_name, restore)).await?
    }

    /// Abort an in-flight snapshot so the node does not stay write-blocked.
    /// Restores are left on disk for the operator.
    pub async fn shutdown(&self) {
        loop {
            let settled = self.slot.settled.notified();
            let mut current = self.slot.current.lock().await;
            match current.as_ref() {
                Some(op) if matches!(op.kind, Kind::Snapshot(_)) => {
                    if op.in_progress() {
                        op.cancel.cancel();
                        drop(current);
                        settled.await;
                        continue;
                    }
                }
                _ => return,
            }
            if let Some(op) = current.take() {
                info!(operation = %op.describe(), "Aborting in-flight snapshot on shutdown");
                if let Err(e) = remove_dir(op.scratch_dir()).await {
                    warn!("Failed to remove checkpoint on shutdown: {}", e);
                }
            }
            return;
        }
    }
}

impl Default for NodeController {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy the checkpoint for a claimed begin, then settle the slot.
async fn capture(slot: Arc<Slot>, req: BeginRequest, cancel: CancellationToken) -> Result<BeginAck> {
    let dest = checkpoint_path(&req.root_dir, &req.backup_name);
    let data_dir = req.data_dir.clone();
    let target = dest.clone();
    let name = req.backup_name.clone();
    let (role, requested) = (req.role, req.spaces.clone());

    let outcome = tokio::task::spawn_blocking(move || {
        let spaces = checkpoint::resolve_spaces(&data_dir, role, &requested)?;
        let info = CheckpointInfo {
            backup_name: name,
            role,
            spaces,
        };
        let (files, bytes) = checkpoint::create_checkpoint(&data_dir, &target, &info)?;
        Ok::<_, AgentError>((info.spaces, files, bytes))
    })
    .await
    .map_err(AgentError::from)
    .and_then(|r| r);

    let mut current = slot.current.lock().await;
    let result = match outcome {
        Ok(_) if cancel.is_cancelled() => Err(AgentError::Aborted(req.backup_name.clone())),
        other => other,
    };
    let result = match result {
        Ok((spaces, files, bytes)) => {
            if let Some(snap) = snapshot_mut(&mut current) {
                snap.spaces = spaces.clone();
                snap.files = files;
                snap.bytes = bytes;
                snap.phase = SnapshotPhase::Begun;
            }
            info!(
                backup = %req.backup_name,
                role = %role,
                ?spaces,
                files,
                bytes,
                "Snapshot begun, writes blocked"
            );
            Ok(BeginAck {
                backup_name: req.backup_name,
                token: req.token,
                spaces,
            })
        }
        Err(e) => {
            *current = None;
            if let Err(rm) = remove_dir(dest).await {
                warn!("Failed to remove partial checkpoint: {}", rm);
            }
            Err(e)
        }
    };
    drop(current);
    slot.settled.notify_waiters();
    result
}

async fn push_checkpoint(
    transporter: &Transporter,
    dir: &Path,
    key: &str,
    expected_files: usize,
) -> Result<ArtifactRef> {
    if !dir.is_dir() {
        return Err(AgentError::CheckpointMissing(dir.display().to_string()));
    }
    transporter.backend().check().await?;
    let (artifact, _) = transporter.push(dir, key).await?;
    if artifact.files.len() != expected_files {
        return Err(AgentError::CheckpointChanged(format!(
            "{} held {} files at commit, {} were uploaded",
            dir.display(),
            expected_files,
            artifact.files.len()
        )));
    }
    Ok(artifact)
}

/// Upload a committed checkpoint, then settle the slot.
async fn ship(
    slot: Arc<Slot>,
    transporter: Transporter,
    req: UploadRequest,
    dir: PathBuf,
    expected_files: usize,
    cancel: CancellationToken,
) -> Result<UploadAck> {
    let outcome = tokio::select! {
        r = push_checkpoint(&transporter, &dir, &req.key, expected_files) => r,
        _ = cancel.cancelled() => Err(AgentError::Aborted(req.backup_name.clone())),
    };

    let mut current = slot.current.lock().await;
    let result = if cancel.is_cancelled() {
        *current = None;
        if let Err(e) = remove_dir(dir).await {
            warn!("Failed to remove checkpoint: {}", e);
        }
        Err(AgentError::Aborted(req.backup_name))
    } else {
        let snap = snapshot_mut(&mut current);
        match outcome {
            Ok(artifact) => {
                info!(backup = %req.backup_name, key = %artifact.key, files = artifact.files.len(), "Checkpoint uploaded");
                if let Some(snap) = snap {
                    snap.phase = SnapshotPhase::Uploaded;
                    snap.artifact = Some(artifact.clone());
                }
                Ok(UploadAck {
                    backup_name: req.backup_name,
                    artifact,
                })
            }
            Err(e) => {
                if let Some(snap) = snap {
                    snap.phase = SnapshotPhase::Committed;
                }
                Err(e)
            }
        }
    };
    drop(current);
    slot.settled.notify_waiters();
    result
}

/// Download every artifact of a claimed restore, then settle the slot.
async fn fetch(
    slot: Arc<Slot>,
    transporter: Transporter,
    req: DownloadRequest,
    cancel: CancellationToken,
) -> Result<DownloadAck> {
    let staging = staging_root(&req.data_dir, &req.backup_name);
    let pull_all = async {
        transporter.backend().check().await?;
        let mut dirs = Vec::with_capacity(req.artifacts.len());
        let (mut files, mut bytes) = (0usize, 0u64);
        for artifact in &req.artifacts {
            let name = artifact_dir_name(&artifact.key)
                .ok_or_else(|| AgentError::InvalidRequest(format!("invalid artifact key {:?}", artifact.key)))?;
            let dir = staging.join(name);
            transporter.pull(artifact, &dir).await?;
            files += artifact.files.len();
            bytes += artifact.bytes;
            dirs.push(dir);
        }
        Ok::<_, AgentError>((dirs, files, bytes))
    };
    let outcome = tokio::select! {
        r = pull_all => r,
        _ = cancel.cancelled() => Err(AgentError::Aborted(req.backup_name.clone())),
    };

    let mut current = slot.current.lock().await;
    let result = if cancel.is_cancelled() {
        *current = None;
        if let Err(e) = remove_dir(staging).await {
            warn!("Failed to remove staging area: {}", e);
        }
        Err(AgentError::Aborted(req.backup_name))
    } else {
        let restore = restore_mut(&mut current);
        match outcome {
            Ok((dirs, files, bytes)) => {
                info!(backup = %req.backup_name, artifacts = dirs.len(), files, bytes, "Artifacts downloaded");
                if let Some(restore) = restore {
                    restore.phase = RestorePhase::Downloaded;
                    restore.artifacts = dirs.clone();
                }
                Ok(DownloadAck {
                    backup_name: req.backup_name,
                    artifacts: dirs,
                    files,
                    bytes,
                })
            }
            Err(e) => {
                if let Some(restore) = restore {
                    restore.phase = RestorePhase::Incomplete;
                }
                Err(e)
            }
        }
    };
    drop(current);
    slot.settled.notify_waiters();
    result
}

/// Move staged data into place, then settle the slot.
async fn swap_in(slot: Arc<Slot>, backup_name: String, restore: RestoreOp) -> Result<LoadAck> {
    let name = backup_name.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        staging::load_staged(&restore.root_dir, &restore.data_dir, &name, &restore.artifacts)
    })
    .await
    .map_err(AgentError::from)
    .and_then(|r| r.map_err(AgentError::from));

    let mut current = slot.current.lock().await;
    let result = match outcome {
        Ok(outcome) => {
            *current = None;
            info!(
                backup = %backup_name,
                files = outcome.files,
                previous = ?outcome.previous_data_dir,
                "Restored data loaded"
            );
            Ok(LoadAck {
                backup_name,
                files: outcome.files,
                previous_data_dir: outcome.previous_data_dir,
            })
        }
        Err(e) => {
            if let Some(restore) = restore_mut(&mut current) {
                restore.phase = RestorePhase::Staged;
            }
            Err(e)
        }
    };
    drop(current);
    slot.settled.notify_waiters();
    result
}

async fn remove_dir(path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || checkpoint::remove_tree(&path)).await??;
    Ok(())
}

fn check_token(backup: &str, actual: &str, expected: &str) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(AgentError::TokenMismatch {
            backup: backup.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

fn validate_backup_name(name: &str) -> Result<()> {
    if is_valid_backup_name(name) {
        Ok(())
    } else {
        Err(AgentError::InvalidRequest(format!("invalid backup name {:?}", name)))
    }
}

fn validate_dir(field: &str, path: &Path) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(AgentError::InvalidRequest(format!(
            "{} must be absolute, got {}",
            field,
            path.display()
        )))
    }
}

fn validate_layout(root_dir: &Path, data_dir: &Path) -> Result<()> {
    validate_dir("root_dir", root_dir)?;
    validate_dir("data_dir", data_dir)?;
    match layout_conflict(root_dir, data_dir) {
        Some(conflict) => Err(AgentError::InvalidRequest(conflict)),
        None => Ok(()),
    }
}
