//! Caller authentication.
//!
//! Every request names its principal in the `x-br-user` header. The agent
//! accepts it when the configured allow-list is empty or contains it.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::protocol::USER_HEADER;
use crate::utils::AgentError;

pub async fn require_user(
    State(state): State<super::AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AgentError> {
    let user = request
        .headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AgentError::Authentication(format!("missing {} header", USER_HEADER)))?;

    if !is_allowed(&state.allowed_users, user) {
        return Err(AgentError::Authentication(format!("user {} is not allowed", user)));
    }

    Ok(next.run(request).await)
}

fn is_allowed(allowed: &[String], user: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|u| u == user)
}
