//! Model runtime collaborator.
//!
//! The local LLM runtime is an external collaborator reached over an
//! OpenAI-compatible HTTP endpoint. This crate defines the consumed
//! interface ([`ModelClient`]), the [`openai`] implementation, and
//! the [`accumulator`] that compiles `list-models-response` payloads
//! from across the mesh into one deduplicated list.

pub mod accumulator;
pub mod openai;

use async_trait::async_trait;
use serde_json::Value;

use diiisco_types::{ChatMessage, ModelInfo, Result};

pub use accumulator::ModelAccumulator;
pub use openai::OpenAiModelClient;

/// The calls the core issues against the model runtime.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Lists the models the runtime serves.
    async fn get_models(&self) -> Result<Vec<ModelInfo>>;

    /// Runs a chat completion, returning the full completion body.
    async fn get_response(&self, model: &str, inputs: &[ChatMessage]) -> Result<Value>;

    /// Deterministic token count over the inputs, for pricing.
    async fn count_embeddings(&self, model: &str, inputs: &[ChatMessage]) -> Result<u64>;
}

/// Deterministic token estimate used when the runtime exposes no
/// tokenizer endpoint: one token per four characters of content,
/// rounded up, plus a fixed four-token framing cost per message.
pub fn estimate_tokens(inputs: &[ChatMessage]) -> u64 {
    inputs
        .iter()
        .map(|m| (m.content.chars().count() as u64).div_ceil(4) + 4)
        .sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
