//! In-memory object store speaking the `HttpBackend` protocol under
//! `/backups`. Used by tests in this crate and, through the `test-support`
//! feature, by the orchestrator's tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::http::SHA256_HEADER;

#[derive(Clone, Default)]
pub struct ObjectStore {
    /// Decoded object keys to content.
    pub objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    /// `<key>=<offset>` for every ranged read served.
    pub ranges: Arc<Mutex<Vec<String>>>,
}

impl ObjectStore {
    /// Serve on an ephemeral port and return the backend URL.
    pub async fn spawn(&self) -> std::io::Result<String> {
        let app = Router::new().fallback(handle).with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(format!("http://{}/backups", addr))
    }
}

fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = raw.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

async fn handle(
    State(store): State<ObjectStore>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(path) = uri
        .path()
        .strip_prefix("/backups/")
        .and_then(percent_decode)
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let path = path.as_str();
    let mut objects = store.objects.lock().await;

    if method == Method::GET && (path.is_empty() || path.ends_with('/')) {
        let mut names: Vec<String> = objects
            .keys()
            .filter_map(|k| k.strip_prefix(path))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() && !path.is_empty() {
            return StatusCode::NOT_FOUND.into_response();
        }
        return axum::Json(names).into_response();
    }

    match method {
        Method::PUT => {
            if headers.contains_key("if-none-match") && objects.contains_key(path) {
                return StatusCode::PRECONDITION_FAILED.into_response();
            }
            objects.insert(path.to_string(), body.to_vec());
            StatusCode::CREATED.into_response()
        }
        Method::HEAD => match objects.get(path) {
            Some(data) => {
                let sha = hex::encode(Sha256::digest(data));
                (StatusCode::OK, [(SHA256_HEADER, sha)]).into_response()
            }
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::GET => {
            let Some(data) = objects.get(path) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            let range = headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("bytes="))
                .and_then(|v| v.strip_suffix('-'))
                .and_then(|v| v.parse::<usize>().ok());
            match range {
                Some(start) if start > data.len() => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
                Some(start) => {
                    store.ranges.lock().await.push(format!("{}={}", path, start));
                    (StatusCode::PARTIAL_CONTENT, data[start..].to_vec()).into_response()
                }
                None => (StatusCode::OK, data.clone()).into_response(),
            }
        }
        Method::DELETE => {
            let nested = format!("{}/", path);
            objects.retain(|k, _| k != path && !k.starts_with(&nested));
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}
