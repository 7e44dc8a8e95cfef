//! HTTP control API for the node agent.

pub mod auth;
pub mod health;
pub mod restore;
pub mod snapshot;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::node::NodeController;
use crate::transport::TransferOptions;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<NodeController>,
    pub allowed_users: Arc<Vec<String>>,
}

/// Create shared application state
pub fn create_app_state(allowed_users: Vec<String>, transfer: TransferOptions) -> AppState {
    AppState {
        controller: Arc::new(NodeController::with_transfer(transfer)),
        allowed_users: Arc::new(allowed_users),
    }
}

/// Create the API router with a pre-existing state
pub fn create_router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/snapshot/begin", post(snapshot::begin))
        .route("/snapshot/commit", post(snapshot::commit))
        .route("/snapshot/abort", post(snapshot::abort))
        .route("/snapshot/release", post(snapshot::release))
        .route("/snapshot/upload", post(snapshot::upload))
        .route("/restore/download", post(restore::download))
        .route("/restore/stage", post(restore::stage))
        .route("/restore/load", post(restore::load))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_user))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
