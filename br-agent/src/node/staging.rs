//! Restore-side file handling: validating staged artifacts and swapping them
//! into the node's data dir.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::node::checkpoint::remove_tree;
use crate::protocol::{
    staging_root, CheckpointInfo, NodeRole, CHECKPOINT_INFO, PREVIOUS_DATA_DIR, STAGING_DIR,
};
use crate::utils::{AgentError, Result};

fn read_descriptor(artifact: &Path) -> Result<CheckpointInfo> {
    let path = artifact.join(CHECKPOINT_INFO);
    let raw = fs::read(&path).map_err(|e| {
        AgentError::InvalidRequest(format!("artifact {} has no readable {}: {}", artifact.display(), CHECKPOINT_INFO, e))
    })?;
    serde_json::from_slice(&raw)
        .map_err(|e| AgentError::InvalidRequest(format!("{} is not a checkpoint descriptor: {}", path.display(), e)))
}

/// Check that every artifact dir sits in this backup's staging area, exists,
/// belongs to `backup_name` and `role`, and that no two artifacts carry the
/// same relative file. Counts exclude the descriptors.
pub fn validate_staged(
    data_dir: &Path,
    backup_name: &str,
    role: NodeRole,
    artifacts: &[PathBuf],
) -> Result<(usize, u64)> {
    let staging = staging_root(data_dir, backup_name);
    let mut seen = HashSet::new();
    let mut bytes = 0u64;

    if artifacts.is_empty() {
        return Err(AgentError::InvalidRequest("no artifacts to stage".into()));
    }

    for artifact in artifacts {
        if artifact.components().any(|c| c == Component::ParentDir) || !artifact.starts_with(&staging) {
            return Err(AgentError::InvalidRequest(format!(
                "artifact {} is outside {}",
                artifact.display(),
                staging.display()
            )));
        }
        if !artifact.is_dir() {
            return Err(AgentError::InvalidRequest(format!(
                "artifact {} has not been pulled",
                artifact.display()
            )));
        }
        let info = read_descriptor(artifact)?;
        if info.backup_name != backup_name || info.role != role {
            return Err(AgentError::InvalidRequest(format!(
                "artifact {} holds {} data of backup {}, expected {} data of {}",
                artifact.display(),
                info.role,
                info.backup_name,
                role,
                backup_name
            )));
        }
        for file in walk_directory(artifact, &WalkOptions::default())? {
            let key = file.relative_key();
            if key == CHECKPOINT_INFO {
                continue;
            }
            if !seen.insert(key.to_string()) {
                return Err(AgentError::StagingConflict(key.to_string()));
            }
            bytes += file.size;
        }
    }

    Ok((seen.len(), bytes))
}

/// Outcome of a load.
#[derive(Debug)]
pub struct LoadOutcome {
    pub files: usize,
    pub previous_data_dir: Option<PathBuf>,
}

/// Move the current contents of `data_dir` aside, then move every staged file
/// into place. The staging area for the backup is removed afterwards.
pub fn load_staged(
    root_dir: &Path,
    data_dir: &Path,
    backup_name: &str,
    artifacts: &[PathBuf],
) -> io::Result<LoadOutcome> {
    let previous = root_dir.join(PREVIOUS_DATA_DIR).join(backup_name);
    let mut moved_aside = false;

    fs::create_dir_all(data_dir)?;
    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        if entry.file_name() == STAGING_DIR {
            continue;
        }
        if !moved_aside {
            remove_tree(&previous)?;
            fs::create_dir_all(&previous)?;
            moved_aside = true;
        }
        move_path(&entry.path(), &previous.join(entry.file_name()))?;
    }

    let mut files = 0usize;
    for artifact in artifacts {
        for file in walk_directory(artifact, &WalkOptions::default())? {
            if file.relative_key() == CHECKPOINT_INFO {
                continue;
            }
            let target = data_dir.join(&file.relative_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            move_path(&file.path, &target)?;
            files += 1;
        }
    }

    remove_tree(&staging_root(data_dir, backup_name))?;
    let staging_parent = data_dir.join(STAGING_DIR);
    if fs::read_dir(&staging_parent).map(|mut d| d.next().is_none()).unwrap_or(false) {
        remove_tree(&staging_parent)?;
    }

    Ok(LoadOutcome {
        files,
        previous_data_dir: moved_aside.then_some(previous),
    })
}

/// Rename `from` to `to`, falling back to copy + remove when the rename
/// crosses filesystems.
fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    if let Err(rename_err) = fs::rename(from, to) {
        if from.is_dir() {
            copy_tree(from, to)?;
            fs::remove_dir_all(from)?;
        } else {
            fs::copy(from, to).map_err(|copy_err| {
                io::Error::new(
                    copy_err.kind(),
                    format!("move {} failed: {} (rename: {})", from.display(), copy_err, rename_err),
                )
            })?;
            fs::remove_file(from)?;
        }
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    let options = WalkOptions {
        exclude_prefixes: Vec::new(),
        ..WalkOptions::default()
    };
    fs::create_dir_all(to)?;
    for file in walk_directory(from, &options)? {
        let target = to.join(&file.relative_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&file.path, &target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn role_of(source: &str) -> NodeRole {
        if source.starts_with("meta") {
            NodeRole::Meta
        } else {
            NodeRole::Storage
        }
    }

    fn stage(data: &Path, backup: &str, source: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let dir = staging_root(data, backup).join(source);
        fs::create_dir_all(&dir).unwrap();
        let info = CheckpointInfo {
            backup_name: backup.to_string(),
            role: role_of(source),
            spaces: vec!["nba".into()],
        };
        fs::write(dir.join(CHECKPOINT_INFO), serde_json::to_vec(&info).unwrap()).unwrap();
        for (rel, content) in files {
            let p = dir.join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, content).unwrap();
        }
        dir
    }

    #[test]
    fn test_validate_counts_files() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        let a = stage(&data, "B1", "storage-0", &[("nba/1.sst", b"abc")]);
        let b = stage(&data, "B1", "storage-1", &[("nba/2.sst", b"de")]);

        let (files, bytes) = validate_staged(&data, "B1", NodeRole::Storage, &[a, b]).unwrap();
        assert_eq!(files, 2);
        assert_eq!(bytes, 5);
    }

    #[test]
    fn test_validate_detects_conflict() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        let a = stage(&data, "B1", "storage-0", &[("nba/1.sst", b"abc")]);
        let b = stage(&data, "B1", "storage-1", &[("nba/1.sst", b"xyz")]);

        let err = validate_staged(&data, "B1", NodeRole::Storage, &[a, b]).unwrap_err();
        assert!(matches!(err, AgentError::StagingConflict(ref k) if k == "nba/1.sst"));
    }

    #[test]
    fn test_validate_rejects_outside_paths() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        let outside = root.path().join("elsewhere");
        fs::create_dir_all(&outside).unwrap();

        let err = validate_staged(&data, "B1", NodeRole::Storage, &[outside]).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));

        let sneaky = staging_root(&data, "B1").join("../../../elsewhere");
        let err = validate_staged(&data, "B1", NodeRole::Storage, &[sneaky]).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));
    }

    #[test]
    fn test_validate_rejects_missing_artifact() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        let missing = staging_root(&data, "B1").join("meta-0");
        let err = validate_staged(&data, "B1", NodeRole::Meta, &[missing]).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));
    }

    #[test]
    fn test_validate_checks_descriptor() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        let storage = stage(&data, "B1", "storage-0", &[("nba/1.sst", b"abc")]);

        let err = validate_staged(&data, "B1", NodeRole::Meta, &[storage.clone()]).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(ref m) if m.contains("expected meta")));

        let bare = staging_root(&data, "B1").join("storage-1");
        fs::create_dir_all(bare.join("nba")).unwrap();
        fs::write(bare.join("nba/2.sst"), b"x").unwrap();
        let err = validate_staged(&data, "B1", NodeRole::Storage, &[storage, bare]).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(ref m) if m.contains(CHECKPOINT_INFO)));
    }

    #[test]
    fn test_load_swaps_data() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        fs::create_dir_all(data.join("old_space")).unwrap();
        fs::write(data.join("old_space/x.sst"), b"old").unwrap();
        let a = stage(&data, "B1", "meta-0", &[("users.tbl", b"u"), ("nba/1.sst", b"abc")]);

        let outcome = load_staged(root.path(), &data, "B1", &[a]).unwrap();

        assert_eq!(outcome.files, 2);
        let previous = outcome.previous_data_dir.unwrap();
        assert_eq!(fs::read(previous.join("old_space/x.sst")).unwrap(), b"old");
        assert_eq!(fs::read(data.join("nba/1.sst")).unwrap(), b"abc");
        assert_eq!(fs::read(data.join("users.tbl")).unwrap(), b"u");
        assert!(!data.join(CHECKPOINT_INFO).exists());
        assert!(!data.join("old_space").exists());
        assert!(!data.join(STAGING_DIR).exists());
    }

    #[test]
    fn test_load_into_empty_data_dir() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        let a = stage(&data, "B1", "storage-0", &[("nba/1.sst", b"abc")]);

        let outcome = load_staged(root.path(), &data, "B1", &[a]).unwrap();
        assert!(outcome.previous_data_dir.is_none());
        assert_eq!(fs::read(data.join("nba/1.sst")).unwrap(), b"abc");
    }
}
