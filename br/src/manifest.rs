//! Backup manifest: the record of one completed backup.
//!
//! Stored as pretty JSON at `<name>/backup_manifest.json`. A manifest only
//! exists once every participant committed and every artifact was pushed
//! and verified, so its presence is what makes a backup restorable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{debug, warn};

use br_agent::protocol::NodeRole;

use crate::error::{BrError, Result};
use crate::registry::NodeTarget;
use crate::transport::{join_key, ArtifactRef, Backend, TransportError};

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "backup_manifest.json";

/// Where a node lived when it was backed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub role: NodeRole,
    pub index: usize,
    pub addrs: String,
    pub root: PathBuf,
    pub data: PathBuf,
}

impl NodeRecord {
    pub fn from_target(target: &NodeTarget) -> Self {
        Self {
            role: target.id.role,
            index: target.id.index,
            addrs: target.info.addrs.clone(),
            root: target.info.root.clone(),
            data: target.info.data.clone(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}-{}", self.role, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeArtifact {
    pub node: NodeRecord,
    pub artifact: ArtifactRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub backend: String,
    /// Logical snapshot token every participant acknowledged.
    pub token: String,
    pub space_names: Vec<String>,
    pub meta_nodes: Vec<NodeArtifact>,
    pub storage_nodes: Vec<NodeArtifact>,
    /// Configured nodes left out of the backup because they were unreachable.
    #[serde(default)]
    pub skipped_nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub checksum: String,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

impl BackupManifest {
    pub fn new(
        name: &str,
        backend: &str,
        token: &str,
        space_names: Vec<String>,
        meta_nodes: Vec<NodeArtifact>,
        storage_nodes: Vec<NodeArtifact>,
        warnings: Vec<String>,
    ) -> Self {
        let mut manifest = Self {
            version: MANIFEST_VERSION,
            name: name.to_string(),
            created_at: Utc::now(),
            backend: backend.to_string(),
            token: token.to_string(),
            space_names,
            meta_nodes,
            storage_nodes,
            skipped_nodes: Vec::new(),
            warnings,
            checksum: String::new(),
        };
        manifest.checksum = manifest.compute_checksum();
        manifest
    }

    pub fn with_skipped(mut self, skipped_nodes: Vec<NodeRecord>) -> Self {
        self.skipped_nodes = skipped_nodes;
        self.checksum = self.compute_checksum();
        self
    }

    /// Object key of the manifest for a backup name.
    pub fn key(name: &str) -> String {
        join_key(name, MANIFEST_FILE)
    }

    /// SHA-256 over every artifact digest, meta nodes first, then the keys
    /// of skipped nodes.
    pub fn compute_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for entry in self.meta_nodes.iter().chain(self.storage_nodes.iter()) {
            hasher.update(entry.node.key().as_bytes());
            hasher.update(b"=");
            hasher.update(entry.artifact.digest.as_bytes());
            hasher.update(b"\n");
        }
        for node in &self.skipped_nodes {
            hasher.update(b"skipped:");
            hasher.update(node.key().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self) -> Result<()> {
        if self.version > MANIFEST_VERSION {
            return Err(BrError::Manifest(format!(
                "{}: version {} is newer than supported version {}",
                self.name, self.version, MANIFEST_VERSION
            )));
        }
        for entry in self.meta_nodes.iter().chain(self.storage_nodes.iter()) {
            if ArtifactRef::compute_digest(&entry.artifact.files) != entry.artifact.digest {
                return Err(BrError::Manifest(format!(
                    "{}: artifact digest mismatch for {}",
                    self.name,
                    entry.node.key()
                )));
            }
        }
        if self.compute_checksum() != self.checksum {
            return Err(BrError::Manifest(format!("{}: checksum mismatch", self.name)));
        }
        Ok(())
    }

    pub fn nodes(&self, role: NodeRole) -> &[NodeArtifact] {
        match role {
            NodeRole::Meta => &self.meta_nodes,
            NodeRole::Storage => &self.storage_nodes,
        }
    }

    /// Number of `role` nodes configured when the backup was taken,
    /// including skipped ones.
    pub fn configured_count(&self, role: NodeRole) -> usize {
        let skipped = self.skipped_nodes.iter().filter(|n| n.role == role).count();
        self.nodes(role).len() + skipped
    }

    pub fn artifact_for(&self, role: NodeRole, index: usize) -> Option<&NodeArtifact> {
        self.nodes(role).iter().find(|n| n.node.index == index)
    }

    pub fn total_bytes(&self) -> u64 {
        self.meta_nodes
            .iter()
            .chain(self.storage_nodes.iter())
            .map(|n| n.artifact.bytes)
            .sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| BrError::Manifest(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let header: VersionHeader =
            serde_json::from_slice(bytes).map_err(|e| BrError::Manifest(e.to_string()))?;
        if header.version > MANIFEST_VERSION {
            return Err(BrError::Manifest(format!(
                "manifest version {} is newer than supported version {}",
                header.version, MANIFEST_VERSION
            )));
        }
        serde_json::from_slice(bytes).map_err(|e| BrError::Manifest(e.to_string()))
    }

    pub async fn publish(&self, backend: &dyn Backend) -> Result<()> {
        backend.put_bytes(&Self::key(&self.name), self.to_json()?).await?;
        Ok(())
    }

    pub async fn exists(backend: &dyn Backend, name: &str) -> Result<bool> {
        Ok(backend.exists(&Self::key(name)).await?)
    }

    /// Fetch and verify the manifest for `name`.
    pub async fn load(backend: &dyn Backend, name: &str) -> Result<Self> {
        let bytes = match backend.get_bytes(&Self::key(name)).await {
            Ok(bytes) => bytes,
            Err(TransportError::NotFound(_)) => return Err(BrError::BackupNotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        };
        let manifest = Self::from_json(&bytes)?;
        if manifest.name != name {
            return Err(BrError::Manifest(format!(
                "manifest under {} names backup {}",
                name, manifest.name
            )));
        }
        manifest.verify()?;
        Ok(manifest)
    }

    /// Every published backup on the backend, oldest first. Names without a
    /// manifest (failed or running backups) are skipped.
    pub async fn list(backend: &dyn Backend) -> Result<Vec<Self>> {
        let mut manifests = Vec::new();
        for name in backend.list("").await? {
            match Self::load(backend, &name).await {
                Ok(m) => manifests.push(m),
                Err(BrError::BackupNotFound(_)) => debug!(name = %name, "No manifest, skipping"),
                Err(e) => warn!(name = %name, "Unreadable manifest: {}", e),
            }
        }
        manifests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(manifests)
    }
}
