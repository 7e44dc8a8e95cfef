//! Error taxonomy for backup and restore runs.

use std::fmt;

use crate::transport::TransportError;

/// Per-node step of a run: the first three make up a backup, the last
/// three a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Begin,
    Commit,
    Upload,
    Download,
    Stage,
    Load,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Begin => "begin",
            Phase::Commit => "commit",
            Phase::Upload => "upload",
            Phase::Download => "download",
            Phase::Stage => "stage",
            Phase::Load => "load",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node outcome of one phase. Nodes are named by their display id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl PhaseReport {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} phase: {} succeeded, {} failed",
            self.phase,
            self.succeeded.len(),
            self.failed.len()
        )?;
        for (node, err) in &self.failed {
            write!(f, "; {}: {}", node, err)?;
        }
        Ok(())
    }
}

/// Outcome of a restore. On failure, `failed_phase` names the step that
/// stopped the run, `loaded` nodes keep the restored data and `unloaded`
/// nodes still need operator attention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup_name: String,
    pub failed_phase: Option<Phase>,
    pub loaded: Vec<String>,
    pub unloaded: Vec<String>,
    pub errors: Vec<(String, String)>,
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backup {}", self.backup_name)?;
        if let Some(phase) = self.failed_phase {
            write!(f, " (failed during {})", phase)?;
        }
        write!(
            f,
            ": loaded [{}], unloaded [{}]",
            self.loaded.join(", "),
            self.unloaded.join(", ")
        )?;
        for (node, err) in &self.errors {
            write!(f, "; {}: {}", node, err)?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BrError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Authentication rejected by {node}: {message}")]
    AuthRejected { node: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Partial failure, {0}")]
    PartialFailure(PhaseReport),

    #[error("Backup {0} not found")]
    BackupNotFound(String),

    #[error("Topology mismatch: {0}")]
    TopologyMismatch(String),

    #[error("Backup name {0} is already in use")]
    NameConflict(String),

    #[error("Restore failed, {0}")]
    RestoreFailed(RestoreReport),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for BrError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Integrity { .. } => BrError::Integrity(e.to_string()),
            TransportError::BackendUnavailable(_) => BrError::BackendUnavailable(e.to_string()),
            TransportError::UnsupportedScheme(_) | TransportError::InvalidUrl(_) => {
                BrError::InvalidConfig(e.to_string())
            }
            TransportError::Io(_)
            | TransportError::Network(_)
            | TransportError::NotFound(_)
            | TransportError::EmptyArtifact(_) => BrError::Transport(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrError>;
