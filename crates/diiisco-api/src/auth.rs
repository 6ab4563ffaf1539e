//! Bearer-token allowlist for the protected routes.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::handlers::ApiState;

/// Middleware guarding `/peers` and `/v1/*`.
///
/// A no-op unless `api.bearerAuthentication` is enabled; then the
/// `Authorization: Bearer <key>` header must name a configured key.
pub async fn require_bearer(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.bearer_required {
        return next.run(request).await;
    }

    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if token_allowed(header, &state.keys) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": { "message": "invalid bearer token", "type": "invalid_request_error" }
            })),
        )
            .into_response()
    }
}

/// Whether an Authorization header names an allowed key.
fn token_allowed(header: Option<&str>, keys: &[String]) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return false;
    };
    keys.iter().any(|key| key == token)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
