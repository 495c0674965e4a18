use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use peer_sync::peer::PASSWORD_HEADER;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Check `X-Sync-Password` when a password is configured.
pub async fn require_password(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = &state.config.password {
        let provided = request
            .headers()
            .get(PASSWORD_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing sync password".into()))?;
        if !same_secret(provided, expected) {
            tracing::warn!(path = %request.uri().path(), "Rejected request with wrong sync password");
            return Err(AppError::Forbidden("Invalid sync password".into()));
        }
    }
    Ok(next.run(request).await)
}

/// Compare digests so the comparison time does not depend on the secret.
fn same_secret(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}
