//! Restore control endpoints.

use axum::{extract::State, Json};

use crate::protocol::{DownloadAck, DownloadRequest, LoadAck, LoadRequest, StageAck, StageRequest};
use crate::utils::Result;

/// POST /restore/download - pull artifacts into the staging area
pub async fn download(
    State(state): State<super::AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<DownloadAck>> {
    tracing::info!(backup = %req.backup_name, artifacts = req.artifacts.len(), "Restore download requested");
    Ok(Json(state.controller.download(req).await?))
}

/// POST /restore/stage - verify downloaded artifacts and hold them for load
pub async fn stage(
    State(state): State<super::AppState>,
    Json(req): Json<StageRequest>,
) -> Result<Json<StageAck>> {
    tracing::info!(backup = %req.backup_name, artifacts = req.artifacts.len(), "Restore stage requested");
    Ok(Json(state.controller.stage(req).await?))
}

/// POST /restore/load - swap staged data into the node's data dir
pub async fn load(
    State(state): State<super::AppState>,
    Json(req): Json<LoadRequest>,
) -> Result<Json<LoadAck>> {
    Ok(Json(state.controller.load(req).await?))
}
