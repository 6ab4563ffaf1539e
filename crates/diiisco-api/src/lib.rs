//! HTTP façade for a diiisco node.
//!
//! The canonical external entry point:
//!
//! - `GET /health` — liveness, no auth.
//! - `GET /peers` — live connections.
//! - `GET /v1/models` — mesh-wide model list, OpenAI shape.
//! - `POST /v1/chat/completions` — inject a session as the customer
//!   initiator and return the winning provider's completion.
//!
//! `/peers` and `/v1/*` optionally sit behind a bearer-token
//! allowlist.

pub mod auth;
pub mod handlers;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use diiisco_node::NodeHandle;
use diiisco_types::config::ApiConfig;
use diiisco_types::{DiiiscoError, Result};

pub use handlers::ApiState;

/// Serves the façade until the shutdown channel fires.
///
/// Stopping the HTTP listener is the first step of graceful node
/// shutdown; the caller signals the node itself afterwards.
pub async fn serve(
    node: NodeHandle,
    config: ApiConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = ApiState::new(node, &config);

    let protected = Router::new()
        .route("/peers", get(handlers::handle_peers))
        .route("/v1/models", get(handlers::handle_models))
        .route("/v1/chat/completions", post(handlers::handle_chat_completions))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let app = Router::new()
        .route("/health", get(handlers::handle_health))
        .merge(protected)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(|e| DiiiscoError::ConfigError {
            reason: format!("failed to bind API port {}: {e}", config.port),
        })?;
    tracing::info!(port = config.port, "API facade listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| DiiiscoError::NetworkError {
            reason: format!("API server error: {e}"),
        })
}
