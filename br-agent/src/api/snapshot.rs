//! Snapshot control endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::protocol::{BeginAck, BeginRequest, CommitAck, SnapshotRef, UploadAck, UploadRequest};
use crate::utils::Result;

/// POST /snapshot/begin - block writes and capture a checkpoint
pub async fn begin(
    State(state): State<super::AppState>,
    Json(req): Json<BeginRequest>,
) -> Result<Json<BeginAck>> {
    tracing::info!(backup = %req.backup_name, role = %req.role, "Snapshot begin requested");
    Ok(Json(state.controller.begin(req).await?))
}

/// POST /snapshot/commit - seal the checkpoint and release writes
pub async fn commit(
    State(state): State<super::AppState>,
    Json(req): Json<SnapshotRef>,
) -> Result<Json<CommitAck>> {
    Ok(Json(state.controller.commit(req).await?))
}

/// POST /snapshot/abort
pub async fn abort(
    State(state): State<super::AppState>,
    Json(req): Json<SnapshotRef>,
) -> Result<Json<Value>> {
    state.controller.abort(req).await?;
    Ok(Json(json!({ "status": "aborted" })))
}

/// POST /snapshot/upload - push the committed checkpoint to the backend
pub async fn upload(
    State(state): State<super::AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadAck>> {
    tracing::info!(backup = %req.backup_name, key = %req.key, "Checkpoint upload requested");
    Ok(Json(state.controller.upload(req).await?))
}

/// POST /snapshot/release - drop an uploaded checkpoint
pub async fn release(
    State(state): State<super::AppState>,
    Json(req): Json<SnapshotRef>,
) -> Result<Json<Value>> {
    state.controller.release(req).await?;
    Ok(Json(json!({ "status": "released" })))
}
