//! Backend transporter: moves artifact directories to and from the backup
//! backend named by a URL.
//!
//! Every object is written under a `.br-partial.` name and renamed once its
//! SHA-256 matches, so an interrupted transfer can simply be run again. A
//! leftover partial file is resumed from its current length; if the resumed
//! result does not verify, the object is fetched again from the start.

pub mod http;
pub mod local;
#[cfg(any(test, feature = "test-support"))]
pub mod object_store;

use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::fs::walker::{walk_directory, WalkOptions};

pub use http::HttpBackend;
pub use local::LocalBackend;

/// Name prefix of an object or local file still being written.
pub const PARTIAL_PREFIX: &str = ".br-partial.";

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("checksum mismatch for {key}: expected {expected}, got {actual}")]
    Integrity {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unsupported backend scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid backend URL or key: {0}")]
    InvalidUrl(String),

    #[error("artifact {0} holds no files")]
    EmptyArtifact(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One file of an artifact, relative to the artifact root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// A node's pushed checkpoint: every object under `key`, with checksums.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub files: Vec<ArtifactFile>,
    pub bytes: u64,
    pub digest: String,
}

impl ArtifactRef {
    pub fn new(key: String, mut files: Vec<ArtifactFile>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let bytes = files.iter().map(|f| f.size).sum();
        let digest = Self::compute_digest(&files);
        Self {
            key,
            files,
            bytes,
            digest,
        }
    }

    /// SHA-256 over each file's path, size and checksum, in path order.
    pub fn compute_digest(files: &[ArtifactFile]) -> String {
        let mut hasher = Sha256::new();
        for file in files {
            hasher.update(file.path.as_bytes());
            hasher.update(b"\t");
            hasher.update(file.size.to_string().as_bytes());
            hasher.update(b"\t");
            hasher.update(file.sha256.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    pub fn object_key(&self, file: &ArtifactFile) -> String {
        join_key(&self.key, &file.path)
    }
}

/// Capabilities every backend scheme provides.
#[async_trait]
pub trait Backend: Send + Sync {
    fn url(&self) -> &str;

    /// Fail with `BackendUnavailable` if the backend cannot be used.
    async fn check(&self) -> Result<()>;

    /// Upload `src` as `key` and verify it against `sha256`. Returns `false`
    /// when the object already held exactly this content.
    async fn push_file(&self, src: &Path, key: &str, sha256: &str) -> Result<bool>;

    /// Write object `key` into `dest`, continuing after `offset` bytes when
    /// the backend can. Returns the offset actually honoured.
    async fn fetch_into(&self, key: &str, dest: &Path, offset: u64) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>>;

    /// Create `key` only if it does not exist yet. Returns `false` if it did.
    async fn create_exclusive(&self, key: &str, data: Vec<u8>) -> Result<bool>;

    /// Names directly below `prefix` (`""` lists the top level), sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove an object or everything under a prefix. Missing is fine.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Timeouts applied to backend requests.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub connect_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(3600),
        }
    }
}

/// Counters for one push or pull.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub files: usize,
    pub transferred: usize,
    pub skipped: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f64().max(0.001);
        write!(
            f,
            "{} files ({} transferred, {} already present), {} in {:.1}s, {}",
            self.files,
            self.transferred,
            self.skipped,
            format_bytes(self.bytes),
            secs,
            format_speed((self.bytes as f64 / secs) as u64)
        )
    }
}

/// Entry point for node uploads and downloads. Cheap to clone.
#[derive(Clone)]
pub struct Transporter {
    backend: Arc<dyn Backend>,
}

impl Transporter {
    /// Pick a backend from the URL scheme.
    pub fn open(url: &str, options: &TransferOptions) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))?;

        let backend: Arc<dyn Backend> = match scheme.to_ascii_lowercase().as_str() {
            "local" | "file" => {
                let root = PathBuf::from(rest);
                if !root.is_absolute() {
                    return Err(TransportError::InvalidUrl(format!(
                        "{} (path must be absolute)",
                        url
                    )));
                }
                Arc::new(LocalBackend::new(url, root))
            }
            "http" | "https" => Arc::new(HttpBackend::new(url, options)?),
            other => return Err(TransportError::UnsupportedScheme(other.to_string())),
        };
        Ok(Self { backend })
    }

    pub fn from_backend(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn url(&self) -> &str {
        self.backend.url()
    }

    /// Push every file under `local_dir` to `<key>/<relative path>`.
    ///
    /// A missing directory fails with `NotFound`, an empty one with
    /// `EmptyArtifact`.
    pub async fn push(&self, local_dir: &Path, key: &str) -> Result<(ArtifactRef, TransferStats)> {
        let started = Instant::now();
        let dir = local_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || walk_directory(&dir, &WalkOptions::default()))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;
        if files.is_empty() {
            return Err(TransportError::EmptyArtifact(key.to_string()));
        }

        let mut stats = TransferStats::default();
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let path = file.relative_key().to_string();
            let sha256 = sha256_file(&file.path).await?;
            let object = join_key(key, &path);
            let uploaded = self.backend.push_file(&file.path, &object, &sha256).await?;
            if uploaded {
                stats.transferred += 1;
                stats.bytes += file.size;
            } else {
                stats.skipped += 1;
            }
            stats.files += 1;
            debug!(object = %object, size = file.size, uploaded, "Object pushed");
            entries.push(ArtifactFile {
                path,
                size: file.size,
                sha256,
            });
        }
        stats.elapsed = started.elapsed();

        let artifact = ArtifactRef::new(key.to_string(), entries);
        info!(key = %key, digest = %artifact.digest, "Pushed artifact: {}", stats);
        Ok((artifact, stats))
    }

    /// Fetch every file of `artifact` into `local_dir`, verifying checksums.
    pub async fn pull(&self, artifact: &ArtifactRef, local_dir: &Path) -> Result<TransferStats> {
        if artifact.files.is_empty() {
            return Err(TransportError::EmptyArtifact(artifact.key.clone()));
        }
        let started = Instant::now();
        let mut stats = TransferStats::default();
        fs::create_dir_all(local_dir).await?;

        for file in &artifact.files {
            let target = local_path(local_dir, &file.path)?;
            let object = artifact.object_key(file);
            stats.files += 1;

            if file_matches(&target, file.size, &file.sha256).await? {
                stats.skipped += 1;
                continue;
            }

            let partial = partial_path(&target)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            let existing = match fs::metadata(&partial).await {
                Ok(m) if m.len() <= file.size => m.len(),
                _ => 0,
            };

            let offset = self.backend.fetch_into(&object, &partial, existing).await?;
            let mut actual = sha256_file(&partial).await?;
            if actual != file.sha256 && offset > 0 {
                debug!(object = %object, offset, "Resumed pull did not verify, fetching again");
                self.backend.fetch_into(&object, &partial, 0).await?;
                actual = sha256_file(&partial).await?;
            }
            if actual != file.sha256 {
                let _ = fs::remove_file(&partial).await;
                return Err(TransportError::Integrity {
                    key: object,
                    expected: file.sha256.clone(),
                    actual,
                });
            }

            fs::rename(&partial, &target).await?;
            stats.transferred += 1;
            stats.bytes += file.size;
        }

        stats.elapsed = started.elapsed();
        info!(key = %artifact.key, dest = %local_dir.display(), "Pulled artifact: {}", stats);
        Ok(stats)
    }
}

/// Join backend key segments with `/`.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Split a key into path segments, refusing anything that could escape.
pub(crate) fn key_segments(key: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    if segments.iter().any(|s| *s == "." || *s == ".." || s.contains('\\')) {
        return Err(TransportError::InvalidUrl(format!("invalid object key {:?}", key)));
    }
    Ok(segments)
}

fn local_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in key_segments(relative)? {
        path.push(segment);
    }
    Ok(path)
}

/// `<dir>/.br-partial.<file name>` for a destination path.
pub(crate) fn partial_path(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| TransportError::InvalidUrl(target.display().to_string()))?;
    Ok(target.with_file_name(format!("{}{}", PARTIAL_PREFIX, name.to_string_lossy())))
}

/// Streaming SHA-256 of a file, hex encoded.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) async fn file_matches(path: &Path, size: u64, sha256: &str) -> std::io::Result<bool> {
    match fs::metadata(path).await {
        Ok(m) if m.is_file() && m.len() == size => Ok(sha256_file(path).await? == sha256),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Copy `src` into `dest` starting at `offset`: the first `offset` bytes of
/// `dest` are kept and the rest is replaced. Returns the bytes written.
pub(crate) async fn copy_from_offset(src: &Path, dest: &Path, offset: u64) -> std::io::Result<u64> {
    let mut input = fs::File::open(src).await?;
    let mut output = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dest)
        .await?;
    output.set_len(offset).await?;
    output.seek(SeekFrom::Start(offset)).await?;
    input.seek(SeekFrom::Start(offset)).await?;

    let written = tokio::io::copy(&mut input, &mut output).await?;
    output.flush().await?;
    output.sync_all().await?;
    Ok(written)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
