//! OpenAI-compatible HTTP client for the local model runtime.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use diiisco_types::{ChatMessage, DiiiscoError, ModelInfo, Result};

use crate::{estimate_tokens, ModelClient};

/// Client for an OpenAI-compatible runtime (Ollama, vLLM, llama.cpp).
pub struct OpenAiModelClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

/// Shape of `GET /v1/models`.
#[derive(Deserialize)]
struct ModelListBody {
    data: Vec<ModelInfo>,
}

impl OpenAiModelClient {
    /// Creates a client against `base_url` (no trailing slash needed).
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {key}")),
            None => req,
        }
    }

    fn runtime_err(context: &str, e: impl std::fmt::Display) -> DiiiscoError {
        DiiiscoError::InferenceFailed {
            reason: format!("{context}: {e}"),
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiModelClient {
    async fn get_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .auth(self.http.get(&url))
            .send()
            .await
            .map_err(|e| Self::runtime_err("model runtime unreachable", e))?;

        if !resp.status().is_success() {
            return Err(Self::runtime_err("model list failed", resp.status()));
        }

        let body: ModelListBody = resp
            .json()
            .await
            .map_err(|e| Self::runtime_err("malformed model list", e))?;
        Ok(body.data)
    }

    async fn get_response(&self, model: &str, inputs: &[ChatMessage]) -> Result<Value> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": model,
            "messages": inputs,
        });

        let resp = self
            .auth(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::runtime_err("model runtime unreachable", e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Self::runtime_err("completion failed", status));
        }

        let completion: Value = resp
            .json()
            .await
            .map_err(|e| Self::runtime_err("malformed completion body", e))?;

        tracing::debug!(model, "completion received from runtime");
        Ok(completion)
    }

    async fn count_embeddings(&self, _model: &str, inputs: &[ChatMessage]) -> Result<u64> {
        // The tokenizer is an external collaborator; the runtime's
        // OpenAI surface exposes no tokenize endpoint, so pricing uses
        // the deterministic estimate shared by both sides of a trade.
        Ok(estimate_tokens(inputs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = OpenAiModelClient::new("http://localhost:11434/", None);
        assert_eq!(client.base_url, "http://localhost:11434");
    }

    #[tokio::test]
    async fn count_embeddings_matches_estimate() {
        let client = OpenAiModelClient::new("http://localhost:11434", None);
        let inputs = vec![ChatMessage {
            role: "user".into(),
            content: "hi".into(),
        }];
        let count = client.count_embeddings("m", &inputs).await.unwrap();
        assert_eq!(count, estimate_tokens(&inputs));
    }
}
