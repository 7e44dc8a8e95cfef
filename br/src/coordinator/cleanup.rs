//! Leftovers of an interrupted run: node-side snapshot or staging state and
//! backend objects of a backup that was never published.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use br_agent::protocol::{NodeRole, SnapshotRef};

use super::{resolve_all, run_phase, PhaseLimits};
use crate::config::BackupConfig;
use crate::error::{BrError, Result};
use crate::manifest::BackupManifest;
use crate::registry::{NodeConnector, NodeRegistry, NodeTarget};
use crate::settings::Settings;
use crate::transport::Transporter;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub backup_name: String,
    pub aborted: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Backend objects were removed; false when the backup is published.
    pub removed_objects: bool,
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "backup {}: {} nodes cleaned, {} failed, backend objects {}",
            self.backup_name,
            self.aborted.len(),
            self.failed.len(),
            if self.removed_objects { "removed" } else { "kept" }
        )?;
        for (node, err) in &self.failed {
            write!(f, "; {}: {}", node, err)?;
        }
        Ok(())
    }
}

/// Abort `name` on every configured node, then remove its backend objects
/// unless a manifest was published for it.
pub async fn cleanup_backup(
    connector: Arc<dyn NodeConnector>,
    settings: &Settings,
    config: &BackupConfig,
    name: &str,
    cancel: &CancellationToken,
) -> Result<CleanupReport> {
    config.validate()?;
    let transporter = Transporter::open(&config.backend, &settings.transfer_options())?;
    transporter.backend().check().await?;

    let registry = NodeRegistry::new(connector, settings);
    let mut targets = NodeTarget::from_config(NodeRole::Meta, &config.meta_nodes);
    targets.extend(NodeTarget::from_config(NodeRole::Storage, &config.storage_nodes));

    let mut report = CleanupReport {
        backup_name: name.to_string(),
        ..CleanupReport::default()
    };
    let mut reachable = Vec::new();
    for (target, result) in resolve_all(&registry, &targets, cancel).await? {
        match result {
            Ok(node) => reachable.push(node),
            Err(e) => report.failed.push((target.id.to_string(), e.to_string())),
        }
    }

    // Agents match abort by name only.
    let snapshot = SnapshotRef {
        backup_name: name.to_string(),
        token: String::new(),
    };
    let items: Vec<_> = reachable
        .iter()
        .map(|node| (node.session.clone(), snapshot.clone()))
        .collect();
    let limits = PhaseLimits {
        fan_out: settings.fan_out,
        timeout: settings.call_timeout,
    };
    let results = run_phase(items, &limits, cancel, |(session, snapshot)| async move {
        session.abort(snapshot).await
    })
    .await;
    for (node, result) in reachable.iter().zip(results) {
        match result {
            Ok(()) => report.aborted.push(node.id().to_string()),
            Err(e) => report.failed.push((node.id().to_string(), e.to_string())),
        }
    }
    if cancel.is_cancelled() {
        return Err(BrError::Cancelled);
    }

    let backend = transporter.backend();
    if BackupManifest::exists(backend, name).await? {
        warn!(backup = %name, "Backup is published, keeping its backend objects");
    } else {
        backend.remove(name).await?;
        report.removed_objects = true;
    }

    info!(backup = %name, "Cleanup finished: {}", report);
    Ok(report)
}
