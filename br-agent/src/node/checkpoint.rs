//! Checkpoint creation for snapshot-begin.
//!
//! Space data lives in one directory per space directly under the node's data
//! dir. A meta node also keeps cluster-wide tables as top-level files, which
//! every meta checkpoint carries. Each checkpoint starts with a
//! [`CHECKPOINT_INFO`] descriptor naming its backup, role and spaces.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;

use crate::fs::walker::{walk_directory, WalkOptions, INTERNAL_PREFIX};
use crate::protocol::{CheckpointInfo, NodeRole, CHECKPOINT_INFO};
use crate::utils::{AgentError, Result};

fn utf8_name(name: OsString, dir: &Path) -> io::Result<String> {
    name.into_string().map_err(|name| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("name {:?} under {} is not valid UTF-8", name, dir.display()),
        )
    })
}

/// Names of the space directories under `data_dir`, sorted.
pub fn list_spaces(data_dir: &Path) -> io::Result<Vec<String>> {
    let mut spaces = Vec::new();
    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = utf8_name(entry.file_name(), data_dir)?;
        if name.starts_with('.') {
            continue;
        }
        spaces.push(name);
    }
    spaces.sort();
    Ok(spaces)
}

/// Decide which spaces a checkpoint covers.
///
/// A meta node is the authority: an empty request means every space it knows,
/// and an unknown space is an error. A storage node captures whatever subset
/// of the requested spaces it holds.
pub fn resolve_spaces(data_dir: &Path, role: NodeRole, requested: &[String]) -> Result<Vec<String>> {
    let available = list_spaces(data_dir)?;

    let mut spaces: Vec<String> = if requested.is_empty() {
        available.clone()
    } else {
        requested.to_vec()
    };
    spaces.sort();
    spaces.dedup();

    if role == NodeRole::Meta {
        if spaces.is_empty() {
            return Err(AgentError::NoSpaces(data_dir.display().to_string()));
        }
        let missing: Vec<String> = spaces
            .iter()
            .filter(|s| !available.contains(s))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(AgentError::SpaceNotFound(missing));
        }
    }

    Ok(spaces)
}

/// Write the descriptor, then copy the selected spaces (and, on meta nodes,
/// the top-level files) from `data_dir` into a fresh `dest`. Returns the
/// number of files and bytes in the checkpoint, descriptor included.
pub fn create_checkpoint(data_dir: &Path, dest: &Path, info: &CheckpointInfo) -> io::Result<(usize, u64)> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;

    let descriptor = serde_json::to_vec_pretty(info)?;
    fs::write(dest.join(CHECKPOINT_INFO), &descriptor)?;
    let mut files = 1usize;
    let mut bytes = descriptor.len() as u64;

    if info.role == NodeRole::Meta {
        for entry in fs::read_dir(data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = utf8_name(entry.file_name(), data_dir)?;
            if name.starts_with(INTERNAL_PREFIX) || name == CHECKPOINT_INFO {
                continue;
            }
            bytes += fs::copy(entry.path(), dest.join(&name))?;
            files += 1;
        }
    }

    for space in &info.spaces {
        let src = data_dir.join(space);
        if !src.is_dir() {
            tracing::debug!(space = %space, "Space not held by this node, skipping");
            continue;
        }
        for file in walk_directory(&src, &WalkOptions::default())? {
            let target = dest.join(space).join(&file.relative_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            bytes += fs::copy(&file.path, &target)?;
            files += 1;
        }
    }

    Ok((files, bytes))
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("nba/part-1")).unwrap();
        fs::create_dir_all(dir.path().join("basketball")).unwrap();
        fs::create_dir_all(dir.path().join(".br-staging/old")).unwrap();
        fs::write(dir.path().join("nba/part-1/000001.sst"), b"players").unwrap();
        fs::write(dir.path().join("basketball/000002.sst"), b"teams").unwrap();
        fs::write(dir.path().join("users.tbl"), b"root").unwrap();
        dir
    }

    fn info(role: NodeRole, spaces: &[&str]) -> CheckpointInfo {
        CheckpointInfo {
            backup_name: "B1".into(),
            role,
            spaces: spaces.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn descriptor_len(cp: &Path) -> u64 {
        fs::metadata(cp.join(CHECKPOINT_INFO)).unwrap().len()
    }

    #[test]
    fn test_list_spaces_skips_hidden() {
        let dir = data_dir();
        assert_eq!(list_spaces(dir.path()).unwrap(), vec!["basketball", "nba"]);
    }

    #[test]
    fn test_meta_resolves_all_spaces_when_empty() {
        let dir = data_dir();
        let spaces = resolve_spaces(dir.path(), NodeRole::Meta, &[]).unwrap();
        assert_eq!(spaces, vec!["basketball", "nba"]);
    }

    #[test]
    fn test_meta_rejects_unknown_space() {
        let dir = data_dir();
        let err = resolve_spaces(dir.path(), NodeRole::Meta, &["nba".into(), "ghost".into()])
            .unwrap_err();
        assert!(matches!(err, AgentError::SpaceNotFound(ref m) if m == &vec!["ghost".to_string()]));
    }

    #[test]
    fn test_meta_without_spaces_refuses() {
        let dir = TempDir::new().unwrap();
        let err = resolve_spaces(dir.path(), NodeRole::Meta, &[]).unwrap_err();
        assert!(matches!(err, AgentError::NoSpaces(_)));
    }

    #[test]
    fn test_storage_keeps_requested_spaces() {
        let dir = data_dir();
        let spaces =
            resolve_spaces(dir.path(), NodeRole::Storage, &["nba".into(), "ghost".into(), "nba".into()])
                .unwrap();
        assert_eq!(spaces, vec!["ghost", "nba"]);
    }

    #[test]
    fn test_meta_checkpoint_includes_top_level_files() {
        let dir = data_dir();
        let dest = TempDir::new().unwrap();
        let cp = dest.path().join("cp");

        let (files, bytes) = create_checkpoint(dir.path(), &cp, &info(NodeRole::Meta, &["nba"])).unwrap();

        assert_eq!(files, 3);
        assert_eq!(bytes, 11 + descriptor_len(&cp));
        let written: CheckpointInfo =
            serde_json::from_slice(&fs::read(cp.join(CHECKPOINT_INFO)).unwrap()).unwrap();
        assert_eq!(written, info(NodeRole::Meta, &["nba"]));
        assert_eq!(fs::read(cp.join("users.tbl")).unwrap(), b"root");
        assert_eq!(fs::read(cp.join("nba/part-1/000001.sst")).unwrap(), b"players");
        assert!(!cp.join("basketball").exists());
        assert!(!cp.join(".br-staging").exists());
    }

    #[test]
    fn test_storage_checkpoint_skips_missing_space() {
        let dir = data_dir();
        let dest = TempDir::new().unwrap();
        let cp = dest.path().join("cp");

        let (files, _) =
            create_checkpoint(dir.path(), &cp, &info(NodeRole::Storage, &["basketball", "ghost"])).unwrap();

        assert_eq!(files, 2);
        assert!(!cp.join("users.tbl").exists());
        assert!(cp.join("basketball/000002.sst").exists());
    }

    #[test]
    fn test_checkpoint_replaces_stale_destination() {
        let dir = data_dir();
        let dest = TempDir::new().unwrap();
        let cp = dest.path().join("cp");
        fs::create_dir_all(&cp).unwrap();
        fs::write(cp.join("stale"), b"x").unwrap();

        create_checkpoint(dir.path(), &cp, &info(NodeRole::Storage, &["nba"])).unwrap();
        assert!(!cp.join("stale").exists());
    }

    #[test]
    fn test_storage_without_held_spaces_still_has_descriptor() {
        let dir = data_dir();
        let dest = TempDir::new().unwrap();
        let cp = dest.path().join("cp");

        let (files, bytes) = create_checkpoint(dir.path(), &cp, &info(NodeRole::Storage, &["ghost"])).unwrap();
        assert_eq!(files, 1);
        assert_eq!(bytes, descriptor_len(&cp));
    }

    #[test]
    fn test_remove_tree_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        remove_tree(&dir.path().join("gone")).unwrap();
    }
}
