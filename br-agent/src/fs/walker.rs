//! Directory traversal for checkpoints and artifacts.
//!
//! Walks a tree and yields regular files with their path relative to the
//! walk root. Entries whose name starts with one of the exclude prefixes are
//! pruned together with everything below them.

use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Prefix of every file or directory the backup tooling itself creates.
pub const INTERNAL_PREFIX: &str = ".br-";

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Name prefixes to prune
    pub exclude_prefixes: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            exclude_prefixes: vec![INTERNAL_PREFIX.to_string()],
        }
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    key: String,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let key = utf8_key(&relative_path)?;

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
            key,
        })
    }

    /// Relative path with `/` separators, the form stored in manifests.
    pub fn relative_key(&self) -> &str {
        &self.key
    }
}

/// Join the components of a relative path with `/`. Names that are not
/// valid UTF-8 cannot be stored as object keys and are rejected.
pub fn utf8_key(relative: &Path) -> std::io::Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("file name is not valid UTF-8: {}", relative.display()),
            )
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

/// Walk a directory tree and collect all regular files, sorted by relative path.
///
/// A missing root is an error of kind `NotFound`.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    if !root.is_dir() {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("no directory at {}", root.display()),
        ));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_prefixes));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        files.push(FileInfo::from_entry(&entry, root)?);
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Count files and bytes below `root`.
pub fn tree_size(root: &Path, options: &WalkOptions) -> std::io::Result<(usize, u64)> {
    let files = walk_directory(root, options)?;
    let bytes = files.iter().map(|f| f.size).sum();
    Ok((files.len(), bytes))
}

fn should_exclude(entry: &DirEntry, prefixes: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    prefixes.iter().any(|p| file_name.starts_with(p.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_missing_root() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let err = walk_directory(&temp_dir.path().join("nope"), &WalkOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(tree_size(&temp_dir.path().join("nope"), &WalkOptions::default()).is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_name_rejected() -> std::io::Result<()> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("nba"))?;
        let name = OsStr::from_bytes(b"bad\xff.sst");
        if fs::write(temp_dir.path().join("nba").join(name), b"x").is_err() {
            // Filesystem refuses such names outright.
            return Ok(());
        }

        let err = walk_directory(temp_dir.path(), &WalkOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(utf8_key(Path::new("nba").join(name).as_path()).is_err());
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories_sorted() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("space_b"))?;
        fs::create_dir(temp_dir.path().join("space_a"))?;
        fs::write(temp_dir.path().join("space_b/part1.sst"), b"bb")?;
        fs::write(temp_dir.path().join("space_a/part1.sst"), b"a")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        let keys: Vec<&str> = files.iter().map(|f| f.relative_key()).collect();
        assert_eq!(keys, vec!["space_a/part1.sst", "space_b/part1.sst"]);
        assert_eq!(files[1].size, 2);

        Ok(())
    }

    #[test]
    fn test_internal_entries_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join(".br-staging/B1/meta-0"))?;
        fs::write(temp_dir.path().join(".br-staging/B1/meta-0/x"), b"staged")?;
        fs::write(temp_dir.path().join(".br-partial.CURRENT"), b"half")?;
        fs::write(temp_dir.path().join("CURRENT"), b"keep")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_key(), "CURRENT");

        Ok(())
    }

    #[test]
    fn test_tree_size() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file1"), b"12345")?;
        fs::write(temp_dir.path().join("file2"), b"1234567")?;

        let (count, total) = tree_size(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(count, 2);
        assert_eq!(total, 12);

        Ok(())
    }
}
