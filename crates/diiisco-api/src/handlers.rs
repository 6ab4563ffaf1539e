//! Façade route handlers.
//!
//! The chat-completions handler is the customer initiator of the
//! session workflow: it registers its rendezvous listeners *before*
//! publishing, injects the quote request, accepts the auction winner,
//! and waits for the completion under an outer deadline.

use std::time::Duration;

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use diiisco_node::bus::{inference_response_key, quote_selected_key, BusEvent};
use diiisco_node::NodeHandle;
use diiisco_protocol::envelope::{derive_session_id, Role};
use diiisco_protocol::{CustomerState, Envelope};
use diiisco_types::config::ApiConfig;
use diiisco_types::{now_millis, ChatMessage, DiiiscoError, SessionId};

/// Mesh floor awaited before publishing a quote request.
const MESH_MIN_PEERS: usize = 1;

/// How long to wait for the mesh floor.
const MESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outer deadline for the full session (publish → completion).
const SESSION_DEADLINE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    /// Handle to the running node.
    pub node: NodeHandle,
    /// Whether bearer auth is enforced.
    pub bearer_required: bool,
    /// Accepted bearer tokens.
    pub keys: Vec<String>,
}

impl ApiState {
    /// Builds the state from the API config section.
    pub fn new(node: NodeHandle, config: &ApiConfig) -> Self {
        Self {
            node,
            bearer_required: config.bearer_authentication,
            keys: config.keys.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Handler error rendered in the OpenAI error shape.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<DiiiscoError> for ApiError {
    fn from(error: DiiiscoError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "message": self.message, "type": "api_error" }
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Simple routes
// ---------------------------------------------------------------------------

/// `GET /health` — plain OK once the node is up.
pub async fn handle_health() -> &'static str {
    "OK"
}

/// `GET /peers` — live connections.
pub async fn handle_peers(State(state): State<ApiState>) -> Response {
    match state.node.peers().await {
        Ok(peers) => {
            let peers: Vec<Value> = peers
                .into_iter()
                .map(|p| {
                    json!({
                        "remoteAddr": p.remote_addr,
                        "peerId": p.peer_id,
                        "latencyMs": p.latency_ms,
                    })
                })
                .collect();
            Json(json!({ "peers": peers })).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/models
// ---------------------------------------------------------------------------

/// `GET /v1/models` — broadcast `list-models`, return what the mesh
/// compiled within the auction window.
pub async fn handle_models(State(state): State<ApiState>) -> Response {
    match collect_models(&state.node).await {
        Ok(models) => Json(json!({ "object": "list", "data": models })).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn collect_models(
    node: &NodeHandle,
) -> Result<Vec<diiisco_types::ModelInfo>, DiiiscoError> {
    // Subscribe before publishing so the compiled event cannot race.
    let mut compiled = node.accumulator.subscribe();

    let timestamp = now_millis();
    let id = derive_session_id(timestamp, &json!("list-models"))?;
    let mut envelope = Envelope::new(
        Role::ListModels,
        id,
        timestamp,
        node.wallet_addr(),
        None,
        None,
    );
    node.sign(&mut envelope)?;
    node.send(envelope, None)?;

    // The accumulator debounces for one auction window; give the
    // first response time to arrive on top of that.
    let deadline = node.auction_window() * 2 + Duration::from_secs(1);
    match tokio::time::timeout(deadline, compiled.recv()).await {
        Ok(Ok(models)) => Ok(models),
        // No provider answered; an empty list is a valid answer.
        _ => Ok(Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/chat/completions
// ---------------------------------------------------------------------------

/// `POST /v1/chat/completions` — run one full marketplace session.
pub async fn handle_chat_completions(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> Response {
    let (model, inputs) = match validate_chat_body(&body) {
        Ok(parsed) => parsed,
        Err(message) => return ApiError::bad_request(message).into_response(),
    };

    match run_session(&state.node, &body, model, inputs).await {
        Ok(completion) => Json(completion).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Validates the OpenAI request body; returns `(model, messages)`.
fn validate_chat_body(body: &Value) -> Result<(String, Vec<ChatMessage>), String> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or("body must carry a 'model' string")?;

    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or("body must carry a 'messages' array")?;
    if messages.is_empty() {
        return Err("'messages' must not be empty".into());
    }

    let inputs: Vec<ChatMessage> = messages
        .iter()
        .map(|m| serde_json::from_value(m.clone()))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("malformed message entry: {e}"))?;

    Ok((model.to_string(), inputs))
}

async fn run_session(
    node: &NodeHandle,
    body: &Value,
    model: String,
    inputs: Vec<ChatMessage>,
) -> Result<Value, ApiError> {
    let timestamp = now_millis();
    let id = derive_session_id(timestamp, body)?;
    tracing::info!(%id, model, "chat completion session starting");

    let request_context = json!({ "model": model, "inputs": inputs });

    // Listeners first, then state, then the publish.
    let selected_rx = node.bus.register(quote_selected_key(&id));
    let response_rx = node.bus.register(inference_response_key(&id));
    node.sessions
        .insert_customer(id.clone(), request_context.clone())
        .map_err(|e| {
            cleanup(node, &id);
            ApiError::from(e)
        })?;

    let result = drive_session(node, &id, &request_context, selected_rx, response_rx).await;
    if result.is_err() {
        cleanup(node, &id);
    }
    result
}

async fn drive_session(
    node: &NodeHandle,
    id: &SessionId,
    request_context: &Value,
    selected_rx: tokio::sync::oneshot::Receiver<BusEvent>,
    response_rx: tokio::sync::oneshot::Receiver<BusEvent>,
) -> Result<Value, ApiError> {
    let started = tokio::time::Instant::now();

    node.wait_for_mesh(MESH_MIN_PEERS, MESH_TIMEOUT).await?;

    // Publish the quote request on the well-known topic.
    let mut request = Envelope::new(
        Role::QuoteRequest,
        id.clone(),
        now_millis(),
        node.wallet_addr(),
        None,
        Some(request_context.clone()),
    );
    node.sign(&mut request)?;
    node.send(request, None)?;

    // Await the auction outcome.
    let auction_deadline = node.auction_window() + Duration::from_secs(5);
    let winner = match tokio::time::timeout(auction_deadline, selected_rx).await {
        Ok(Ok(BusEvent::QuoteSelected(bid))) => bid,
        _ => {
            return Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "no provider quoted the request in time",
            ));
        }
    };
    tracing::info!(
        %id,
        provider = %winner.from_peer_id,
        total_price = winner.quote.total_price,
        "auction winner selected"
    );

    // Accept: record the deal, advance, send quote-accepted.
    node.sessions
        .set_deal(id, winner.quote.clone(), Some(winner.from_peer_id.clone()))?;
    node.sessions.advance_customer(id, CustomerState::Accepted)?;

    let target = winner
        .from_peer_id
        .parse()
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "winner peer id invalid"))?;
    let mut accepted_payload = request_context.clone();
    if let Some(map) = accepted_payload.as_object_mut() {
        map.insert("quote".into(), serde_json::to_value(&winner.quote)?);
    }
    let mut accepted = Envelope::new(
        Role::QuoteAccepted,
        id.clone(),
        now_millis(),
        node.wallet_addr(),
        Some(winner.from_peer_id.clone()),
        Some(accepted_payload),
    );
    node.sign(&mut accepted)?;
    node.send(accepted, Some(target))?;

    // Await the completion under the remaining outer deadline.
    let remaining = SESSION_DEADLINE.saturating_sub(started.elapsed());
    let envelope = match tokio::time::timeout(remaining, response_rx).await {
        Ok(Ok(BusEvent::InferenceResponse(envelope))) => envelope,
        _ => {
            return Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "provider did not deliver a completion in time",
            ));
        }
    };

    envelope
        .payload
        .as_ref()
        .and_then(|p| p.get("completion"))
        .cloned()
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "inference response carried no completion",
            )
        })
}

/// Drops the rendezvous listeners and the session after a failure.
fn cleanup(node: &NodeHandle, id: &SessionId) {
    node.bus.cancel(&quote_selected_key(id));
    node.bus.cancel(&inference_response_key(id));
    node.sessions.remove(id);
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_body_parses() {
        let body = json!({
            "model": "gpt-oss:20b",
            "messages": [{ "role": "user", "content": "hi" }]
        });
        let (model, inputs) = validate_chat_body(&body).unwrap();
        assert_eq!(model, "gpt-oss:20b");
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].content, "hi");
    }

    #[test]
    fn missing_model_rejected() {
        let body = json!({ "messages": [{ "role": "user", "content": "hi" }] });
        assert!(validate_chat_body(&body).is_err());
    }

    #[test]
    fn missing_messages_rejected() {
        let body = json!({ "model": "gpt-oss:20b" });
        assert!(validate_chat_body(&body).is_err());
    }

    #[test]
    fn empty_messages_rejected() {
        let body = json!({ "model": "gpt-oss:20b", "messages": [] });
        assert!(validate_chat_body(&body).is_err());
    }

    #[test]
    fn malformed_message_entry_rejected() {
        let body = json!({ "model": "gpt-oss:20b", "messages": [{ "role": "user" }] });
        assert!(validate_chat_body(&body).is_err());
    }
}
