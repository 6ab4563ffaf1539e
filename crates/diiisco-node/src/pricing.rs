//! Quote creation pipeline.
//!
//! Pricing is a first-match pipeline: an ordered list of strategies,
//! each of which may decline by returning `None`. The first strategy
//! producing a [`RawQuote`] wins; an empty or fully-declining
//! pipeline is [`DiiiscoError::NoQuoteProduced`].
//!
//! Strategies are named in config (`quoteEngine.quoteCreationFunction`)
//! and resolved at boot; unknown names are a configuration error.

use std::sync::Arc;

use futures::future::BoxFuture;

use diiisco_model::ModelClient;
use diiisco_protocol::quote::{price_for_tokens, RawQuote};
use diiisco_types::{ChatMessage, DiiiscoError, Result};

/// One named pricing strategy.
type QuoteFn = Box<
    dyn Fn(String, Vec<ChatMessage>) -> BoxFuture<'static, Result<Option<RawQuote>>>
        + Send
        + Sync,
>;

/// Ordered first-match pricing pipeline.
pub struct QuotePipeline {
    entries: Vec<(String, QuoteFn)>,
}

impl QuotePipeline {
    /// Resolves configured strategy names into the pipeline.
    ///
    /// Known strategies:
    /// - `embedding-rate` — price by deterministic token count at the
    ///   configured rate per million tokens.
    /// - `free` — always quotes zero (useful on test meshes).
    pub fn from_config(
        names: &[String],
        model: Arc<dyn ModelClient>,
        rate_per_million: f64,
    ) -> Result<Self> {
        let mut entries: Vec<(String, QuoteFn)> = Vec::with_capacity(names.len());

        for name in names {
            let entry: QuoteFn = match name.as_str() {
                "embedding-rate" => {
                    let model = Arc::clone(&model);
                    Box::new(move |model_id, inputs| {
                        let model = Arc::clone(&model);
                        Box::pin(async move {
                            let tokens = model.count_embeddings(&model_id, &inputs).await?;
                            Ok(Some(RawQuote {
                                price: price_for_tokens(tokens, rate_per_million),
                                rate: rate_per_million,
                                tokens,
                            }))
                        })
                    })
                }
                "free" => Box::new(move |_, inputs| {
                    Box::pin(async move {
                        Ok(Some(RawQuote {
                            price: 0.0,
                            rate: 0.0,
                            tokens: diiisco_model::estimate_tokens(&inputs),
                        }))
                    })
                }),
                other => {
                    return Err(DiiiscoError::ConfigError {
                        reason: format!("unknown quote creation function '{other}'"),
                    });
                }
            };
            entries.push((name.clone(), entry));
        }

        Ok(Self { entries })
    }

    /// Runs the pipeline; first non-`None` result wins.
    pub async fn produce(&self, model_id: &str, inputs: &[ChatMessage]) -> Result<RawQuote> {
        for (name, entry) in &self.entries {
            match entry(model_id.to_string(), inputs.to_vec()).await? {
                Some(raw) => {
                    tracing::debug!(
                        strategy = %name,
                        tokens = raw.tokens,
                        price = raw.price,
                        "quote produced"
                    );
                    return Ok(raw);
                }
                None => continue,
            }
        }
        Err(DiiiscoError::NoQuoteProduced)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
