//! Backup and restore configuration documents.
//!
//! Both are YAML with the field names below; the orchestrator only acts on
//! values that passed [`BackupConfig::validate`] / [`RestoreConfig::validate`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use br_agent::protocol::layout_conflict;

use crate::error::{BrError, Result};

/// One cluster member as the operator describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// `host:port` of the node's control agent.
    pub addrs: String,
    /// Node root directory (checkpoints are written below it).
    pub root: PathBuf,
    /// Node data directory.
    pub data: PathBuf,
    /// Principal the orchestrator authenticates as.
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_user() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub meta_nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub storage_nodes: Vec<NodeInfo>,
    /// Spaces to back up. Empty means every space.
    #[serde(default)]
    pub space_names: Vec<String>,
    /// Backend URL, e.g. `local:///backups` or `http://store:9000/backups`.
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreConfig {
    pub meta_nodes: Vec<NodeInfo>,
    #[serde(default)]
    pub storage_nodes: Vec<NodeInfo>,
    pub backend: String,
    pub backup_name: String,
}

impl BackupConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = parse_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_topology(&self.meta_nodes, &self.storage_nodes, &self.backend)?;
        if self.space_names.iter().any(|s| s.trim().is_empty()) {
            return Err(BrError::InvalidConfig("space_names contains an empty name".into()));
        }
        Ok(())
    }
}

impl RestoreConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = parse_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_topology(&self.meta_nodes, &self.storage_nodes, &self.backend)?;
        if self.backup_name.trim().is_empty() {
            return Err(BrError::InvalidConfig("backup_name must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BrError::InvalidConfig(format!("cannot read {}: {}", path.display(), e)))?;
    serde_yaml::from_str(&content)
        .map_err(|e| BrError::InvalidConfig(format!("{}: {}", path.display(), e)))
}

fn validate_topology(meta: &[NodeInfo], storage: &[NodeInfo], backend: &str) -> Result<()> {
    if meta.is_empty() {
        return Err(BrError::InvalidConfig("meta_nodes must not be empty".into()));
    }
    if backend.trim().is_empty() {
        return Err(BrError::InvalidConfig("backend must not be empty".into()));
    }
    for (role, nodes) in [("meta_nodes", meta), ("storage_nodes", storage)] {
        let mut seen = HashSet::new();
        for node in nodes {
            if node.addrs.trim().is_empty() {
                return Err(BrError::InvalidConfig(format!("{role}: empty addrs")));
            }
            if !seen.insert(node.addrs.as_str()) {
                return Err(BrError::InvalidConfig(format!(
                    "{role}: duplicate addrs {}",
                    node.addrs
                )));
            }
            if !node.root.is_absolute() || !node.data.is_absolute() {
                return Err(BrError::InvalidConfig(format!(
                    "{role}: {} root and data must be absolute paths",
                    node.addrs
                )));
            }
            if let Some(conflict) = layout_conflict(&node.root, &node.data) {
                return Err(BrError::InvalidConfig(format!("{role}: {}: {}", node.addrs, conflict)));
            }
            if node.user.is_empty() {
                return Err(BrError::InvalidConfig(format!("{role}: {} has an empty user", node.addrs)));
            }
        }
    }
    Ok(())
}
