//! Filesystem backend for `local://` and `file://` URLs.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{
    copy_from_offset, file_matches, key_segments, partial_path, sha256_file, Backend, Result,
    TransportError, PARTIAL_PREFIX,
};

pub struct LocalBackend {
    url: String,
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(url: &str, root: PathBuf) -> Self {
        Self {
            url: url.to_string(),
            root,
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key_segments(key)? {
            path.push(segment);
        }
        Ok(path)
    }

    /// Write `data` to `dest` through a partial file and a rename.
    async fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(dest)?;
        let mut file = fs::File::create(&partial).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&partial, dest).await?;
        Ok(())
    }
}

fn not_found(key: &str, e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::NotFound {
        TransportError::NotFound(key.to_string())
    } else {
        TransportError::Io(e)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn url(&self) -> &str {
        &self.url
    }

    async fn check(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            TransportError::BackendUnavailable(format!("{}: {}", self.root.display(), e))
        })?;
        let meta = fs::metadata(&self.root).await.map_err(|e| {
            TransportError::BackendUnavailable(format!("{}: {}", self.root.display(), e))
        })?;
        if meta.permissions().readonly() {
            return Err(TransportError::BackendUnavailable(format!(
                "{} is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn push_file(&self, src: &Path, key: &str, sha256: &str) -> Result<bool> {
        let dest = self.path_for(key)?;
        let size = fs::metadata(src).await?.len();
        if file_matches(&dest, size, sha256).await? {
            return Ok(false);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&dest)?;
        let offset = match fs::metadata(&partial).await {
            Ok(m) if m.len() <= size => m.len(),
            _ => 0,
        };
        if offset > 0 {
            debug!(key = %key, offset, "Resuming partial object");
        }

        copy_from_offset(src, &partial, offset).await?;
        let mut actual = sha256_file(&partial).await?;
        if actual != sha256 && offset > 0 {
            copy_from_offset(src, &partial, 0).await?;
            actual = sha256_file(&partial).await?;
        }
        if actual != sha256 {
            let _ = fs::remove_file(&partial).await;
            return Err(TransportError::Integrity {
                key: key.to_string(),
                expected: sha256.to_string(),
                actual,
            });
        }

        fs::rename(&partial, &dest).await?;
        Ok(true)
    }

    async fn fetch_into(&self, key: &str, dest: &Path, offset: u64) -> Result<u64> {
        let src = self.path_for(key)?;
        let len = fs::metadata(&src).await.map_err(|e| not_found(key, e))?.len();
        let offset = if offset <= len { offset } else { 0 };
        copy_from_offset(&src, dest, offset)
            .await
            .map_err(|e| not_found(key, e))?;
        Ok(offset)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(key)?).await?)
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let dest = self.path_for(key)?;
        self.write_atomic(&dest, &data).await
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.path_for(key)?).await.map_err(|e| not_found(key, e))
    }

    async fn create_exclusive(&self, key: &str, data: Vec<u8>) -> Result<bool> {
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&dest).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(&data).await?;
        file.sync_all().await?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(PARTIAL_PREFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if path == self.root {
            return Err(TransportError::InvalidUrl("refusing to remove the backend root".into()));
        }
        let result = match fs::metadata(&path).await {
            Ok(m) if m.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
