//! Custom error types for the node agent.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::protocol::ErrorBody;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Node busy: {0}")]
    Busy(String),

    #[error("No operation in progress for backup {0}")]
    UnknownOperation(String),

    #[error("Token mismatch for backup {backup}: expected {expected}, got {actual}")]
    TokenMismatch {
        backup: String,
        expected: String,
        actual: String,
    },

    #[error("Spaces not found: {0:?}")]
    SpaceNotFound(Vec<String>),

    #[error("No space to back up under {0}")]
    NoSpaces(String),

    #[error("Staged artifacts conflict on {0}")]
    StagingConflict(String),

    #[error("Checkpoint {0} is missing")]
    CheckpointMissing(String),

    #[error("Checkpoint changed after commit: {0}")]
    CheckpointChanged(String),

    #[error("Transfer failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation for backup {0} was aborted")]
    Aborted(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl AgentError {
    pub fn status(&self) -> StatusCode {
        match self {
            AgentError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AgentError::InvalidRequest(_)
            | AgentError::SpaceNotFound(_)
            | AgentError::NoSpaces(_)
            | AgentError::StagingConflict(_) => StatusCode::BAD_REQUEST,
            AgentError::Busy(_) | AgentError::TokenMismatch { .. } | AgentError::Aborted(_) => {
                StatusCode::CONFLICT
            }
            AgentError::UnknownOperation(_) => StatusCode::NOT_FOUND,
            AgentError::Transport(e) => match e {
                TransportError::InvalidUrl(_) | TransportError::UnsupportedScheme(_) => {
                    StatusCode::BAD_REQUEST
                }
                TransportError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
            AgentError::Config(_)
            | AgentError::Io(_)
            | AgentError::CheckpointMissing(_)
            | AgentError::CheckpointChanged(_)
            | AgentError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(e: tokio::task::JoinError) -> Self {
        AgentError::Task(e.to_string())
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Internal error: {self}");
        } else {
            tracing::warn!(%status, "Request rejected: {self}");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
