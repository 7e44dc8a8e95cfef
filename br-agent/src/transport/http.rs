//! Object-store backend for `http://` and `https://` URLs.
//!
//! Objects live at `<base>/<key>`:
//! - `PUT` stores an object (with `If-None-Match: *`, only if absent: 412 otherwise)
//! - `GET` reads it, honouring `Range: bytes=N-`
//! - `HEAD` reports existence and the stored checksum in `x-br-sha256`
//! - `DELETE` removes an object or every object under a prefix
//! - `GET <base>/<prefix>/` returns the names directly below the prefix as a JSON array

use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, IF_NONE_MATCH, RANGE};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use super::{key_segments, Backend, Result, TransferOptions, TransportError};

/// Header carrying an object's hex SHA-256.
pub const SHA256_HEADER: &str = "x-br-sha256";

pub struct HttpBackend {
    url: String,
    base: Url,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(url: &str, options: &TransferOptions) -> Result<Self> {
        let base = Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))?;
        if base.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.transfer_timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            base,
            client,
        })
    }

    /// Base URL with each key segment appended percent-encoded, so names
    /// holding `#`, `?` or `%` stay distinct objects.
    fn url_for(&self, segments: &[&str], trailing_slash: bool) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| TransportError::InvalidUrl(self.url.clone()))?;
            path.pop_if_empty();
            path.extend(segments);
            if trailing_slash {
                path.push("");
            }
        }
        Ok(url)
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        self.url_for(&key_segments(key)?, false)
    }

    fn prefix_url(&self, prefix: &str) -> Result<Url> {
        self.url_for(&key_segments(prefix)?, true)
    }

    /// Checksum the store holds for an object, `None` if absent.
    async fn remote_sha256(&self, key: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .head(self.object_url(key)?)
            .send()
            .await
            .map_err(send_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp, key)?;
        Ok(resp
            .headers()
            .get(SHA256_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}

fn send_error(e: reqwest::Error) -> TransportError {
    if e.is_connect() || e.is_timeout() {
        TransportError::BackendUnavailable(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

fn check_status(resp: reqwest::Response, key: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status == StatusCode::NOT_FOUND {
        Err(TransportError::NotFound(key.to_string()))
    } else if status.is_server_error() {
        Err(TransportError::BackendUnavailable(format!("{} returned {}", key, status)))
    } else {
        Err(TransportError::Network(format!("{} returned {}", key, status)))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn url(&self) -> &str {
        &self.url
    }

    async fn check(&self) -> Result<()> {
        self.list("").await.map(|_| ()).map_err(|e| match e {
            TransportError::Network(m) => TransportError::BackendUnavailable(m),
            other => other,
        })
    }

    async fn push_file(&self, src: &Path, key: &str, sha256: &str) -> Result<bool> {
        if self.remote_sha256(key).await?.as_deref() == Some(sha256) {
            return Ok(false);
        }

        let file = fs::File::open(src).await?;
        let len = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let resp = self
            .client
            .put(self.object_url(key)?)
            .header(SHA256_HEADER, sha256)
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(send_error)?;
        check_status(resp, key)?;

        match self.remote_sha256(key).await? {
            Some(actual) if actual == sha256 => Ok(true),
            actual => Err(TransportError::Integrity {
                key: key.to_string(),
                expected: sha256.to_string(),
                actual: actual.unwrap_or_else(|| "<missing>".into()),
            }),
        }
    }

    async fn fetch_into(&self, key: &str, dest: &Path, offset: u64) -> Result<u64> {
        let url = self.object_url(key)?;
        let mut offset = offset;
        let mut resp = loop {
            let mut request = self.client.get(url.clone());
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={}-", offset));
            }
            let resp = request.send().await.map_err(send_error)?;
            if resp.status() == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
                offset = 0;
                continue;
            }
            break check_status(resp, key)?;
        };
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            offset = 0;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dest)
            .await?;
        file.set_len(offset).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        while let Some(chunk) = resp.chunk().await.map_err(send_error)? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(offset)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let resp = self
            .client
            .head(self.object_url(key)?)
            .send()
            .await
            .map_err(send_error)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => check_status(resp, key).map(|_| true),
        }
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let sha256 = hex::encode(Sha256::digest(&data));
        let resp = self
            .client
            .put(self.object_url(key)?)
            .header(SHA256_HEADER, sha256)
            .body(data)
            .send()
            .await
            .map_err(send_error)?;
        check_status(resp, key)?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.object_url(key)?)
            .send()
            .await
            .map_err(send_error)?;
        let resp = check_status(resp, key)?;
        Ok(resp.bytes().await.map_err(send_error)?.to_vec())
    }

    async fn create_exclusive(&self, key: &str, data: Vec<u8>) -> Result<bool> {
        let sha256 = hex::encode(Sha256::digest(&data));
        let resp = self
            .client
            .put(self.object_url(key)?)
            .header(IF_NONE_MATCH, "*")
            .header(SHA256_HEADER, sha256)
            .body(data)
            .send()
            .await
            .map_err(send_error)?;
        if resp.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(false);
        }
        check_status(resp, key)?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(self.prefix_url(prefix)?)
            .send()
            .await
            .map_err(send_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = check_status(resp, prefix)?;
        let mut names: Vec<String> = resp
            .json()
            .await
            .map_err(|e| TransportError::Network(format!("invalid listing: {}", e)))?;
        names.sort();
        Ok(names)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if key_segments(key)?.is_empty() {
            return Err(TransportError::InvalidUrl("refusing to remove the backend root".into()));
        }
        let resp = self
            .client
            .delete(self.object_url(key)?)
            .send()
            .await
            .map_err(send_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp, key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::object_store::ObjectStore;
    use crate::transport::{partial_path, Transporter};
    use tempfile::TempDir;

    fn source_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("nba")).unwrap();
        std::fs::write(dir.path().join("nba/1.sst"), vec![3u8; 50_000]).unwrap();
        std::fs::write(dir.path().join("users.tbl"), b"root").unwrap();
        dir
    }

    #[test]
    fn test_key_segments_are_percent_encoded() {
        let backend = HttpBackend::new("http://store:9000/backups/", &TransferOptions::default()).unwrap();
        assert_eq!(
            backend.object_url("B1/meta-0/meta#1").unwrap().as_str(),
            "http://store:9000/backups/B1/meta-0/meta%231"
        );
        assert_eq!(
            backend.object_url("B1/a?b/100%").unwrap().as_str(),
            "http://store:9000/backups/B1/a%3Fb/100%25"
        );
        assert_eq!(backend.prefix_url("").unwrap().as_str(), "http://store:9000/backups/");
        assert_eq!(backend.prefix_url("B1").unwrap().as_str(), "http://store:9000/backups/B1/");
        assert!(backend.object_url("B1/../etc").is_err());
    }

    #[tokio::test]
    async fn test_reserved_characters_in_names_stay_distinct() {
        let store = ObjectStore::default();
        let url = store.spawn().await.unwrap();
        let transporter = Transporter::open(&url, &TransferOptions::default()).unwrap();
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("meta")).unwrap();
        std::fs::write(src.path().join("meta/meta#1"), b"first").unwrap();
        std::fs::write(src.path().join("meta/meta#2"), b"second").unwrap();
        std::fs::write(src.path().join("meta/a?b"), b"query").unwrap();
        std::fs::write(src.path().join("meta/100%"), b"percent").unwrap();

        let (artifact, stats) = transporter.push(src.path(), "B1/meta-0").await.unwrap();
        assert_eq!(stats.transferred, 4);
        {
            let objects = store.objects.lock().await;
            assert_eq!(objects.len(), 4);
            assert_eq!(objects.get("B1/meta-0/meta/meta#1").unwrap(), b"first");
            assert_eq!(objects.get("B1/meta-0/meta/meta#2").unwrap(), b"second");
            assert!(objects.contains_key("B1/meta-0/meta/a?b"));
            assert!(objects.contains_key("B1/meta-0/meta/100%"));
        }

        let dest = TempDir::new().unwrap();
        transporter.pull(&artifact, dest.path()).await.unwrap();
        assert_eq!(std::fs::read(dest.path().join("meta/meta#1")).unwrap(), b"first");
        assert_eq!(std::fs::read(dest.path().join("meta/meta#2")).unwrap(), b"second");
        assert_eq!(std::fs::read(dest.path().join("meta/100%")).unwrap(), b"percent");
    }

    #[tokio::test]
    async fn test_push_pull_over_http() {
        let store = ObjectStore::default();
        let url = store.spawn().await.unwrap();
        let transporter = Transporter::open(&url, &TransferOptions::default()).unwrap();
        transporter.backend().check().await.unwrap();
        let src = source_dir();
        let dest = TempDir::new().unwrap();

        let (artifact, stats) = transporter.push(src.path(), "B1/storage-0").await.unwrap();
        assert_eq!(stats.transferred, 2);
        assert!(store.objects.lock().await.contains_key("B1/storage-0/nba/1.sst"));

        let (_, again) = transporter.push(src.path(), "B1/storage-0").await.unwrap();
        assert_eq!(again.skipped, 2);

        transporter.pull(&artifact, dest.path()).await.unwrap();
        assert_eq!(std::fs::read(dest.path().join("nba/1.sst")).unwrap(), vec![3u8; 50_000]);
    }

    #[tokio::test]
    async fn test_pull_resumes_with_range() {
        let store = ObjectStore::default();
        let url = store.spawn().await.unwrap();
        let transporter = Transporter::open(&url, &TransferOptions::default()).unwrap();
        let src = source_dir();
        let dest = TempDir::new().unwrap();
        let (artifact, _) = transporter.push(src.path(), "B1/meta-0").await.unwrap();

        let target = dest.path().join("nba/1.sst");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(partial_path(&target).unwrap(), vec![3u8; 20_000]).unwrap();

        transporter.pull(&artifact, dest.path()).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), vec![3u8; 50_000]);
        assert_eq!(
            store.ranges.lock().await.clone(),
            vec!["B1/meta-0/nba/1.sst=20000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_exclusive_list_remove() {
        let store = ObjectStore::default();
        let url = store.spawn().await.unwrap();
        let backend = HttpBackend::new(&url, &TransferOptions::default()).unwrap();

        assert!(backend.create_exclusive("B1/.br-lock", b"x".to_vec()).await.unwrap());
        assert!(!backend.create_exclusive("B1/.br-lock", b"y".to_vec()).await.unwrap());
        backend.put_bytes("B2/backup_manifest.json", b"{}".to_vec()).await.unwrap();

        assert_eq!(backend.list("").await.unwrap(), vec!["B1", "B2"]);
        assert_eq!(backend.list("B1").await.unwrap(), vec![".br-lock"]);
        assert_eq!(backend.get_bytes("B2/backup_manifest.json").await.unwrap(), b"{}");

        backend.remove("B1").await.unwrap();
        assert!(!backend.exists("B1/.br-lock").await.unwrap());
        assert!(matches!(
            backend.get_bytes("B1/.br-lock").await,
            Err(TransportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let backend =
            HttpBackend::new(&format!("http://{}/backups", addr), &TransferOptions::default()).unwrap();

        assert!(matches!(
            backend.check().await,
            Err(TransportError::BackendUnavailable(_))
        ));
    }
}
