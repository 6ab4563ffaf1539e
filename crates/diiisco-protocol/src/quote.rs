//! Quote, bid, and pricing types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use diiisco_types::{DiiiscoError, Result};

// ---------------------------------------------------------------------------
// Quote
// ---------------------------------------------------------------------------

/// A priced offer for one inference request.
///
/// Travels inside `quote-response` payloads and is carried unchanged
/// through `quote-accepted`, `contract-created`, and `contract-signed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Model the quote is for.
    pub model: String,
    /// Number of input messages.
    pub input_count: u64,
    /// Token count the price was computed from.
    pub token_count: u64,
    /// Provider's rate in USDC per one million tokens.
    pub price_per_million: f64,
    /// Total price in USDC, rounded to 6 decimals.
    pub total_price: f64,
    /// Provider's wallet address (payment destination).
    pub addr: String,
}

impl Quote {
    /// Total price in USDC base units (micro-USDC).
    pub fn usdc_base_units(&self) -> u64 {
        (self.total_price * 1_000_000.0).round().max(0.0) as u64
    }
}

/// Intermediate output of one pricing pipeline entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawQuote {
    /// Total price in USDC.
    pub price: f64,
    /// Rate in USDC per one million tokens.
    pub rate: f64,
    /// Token count the price was computed from.
    pub tokens: u64,
}

/// One provider bid buffered by the auction engine.
#[derive(Clone, Debug, PartialEq)]
pub struct QuoteBid {
    /// Peer id of the bidding provider.
    pub from_peer_id: String,
    /// The offered quote.
    pub quote: Quote,
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Rounds a price to 6 decimal places.
pub fn round_price(price: f64) -> f64 {
    (price * 1_000_000.0).round() / 1_000_000.0
}

/// Computes `tokens / 1,000,000 × rate`, rounded to 6 decimals.
pub fn price_for_tokens(tokens: u64, rate_per_million: f64) -> f64 {
    round_price(tokens as f64 / 1_000_000.0 * rate_per_million)
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Extracts the `quote` sub-object from a role payload.
///
/// Used by every post-selection handler: `quote-accepted`,
/// `contract-created`, `contract-signed`, and `inference-response`
/// all carry the accepted quote unchanged.
pub fn quote_from_payload(payload: Option<&Value>) -> Result<Quote> {
    let payload = payload.ok_or_else(|| DiiiscoError::ProtocolError {
        reason: "payload missing".into(),
    })?;
    let quote = payload.get("quote").ok_or_else(|| DiiiscoError::ProtocolError {
        reason: "payload carries no quote sub-object".into(),
    })?;
    serde_json::from_value(quote.clone()).map_err(|e| DiiiscoError::ProtocolError {
        reason: format!("malformed quote sub-object: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
