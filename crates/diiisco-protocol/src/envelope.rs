//! Message envelope and role taxonomy.
//!
//! Every message on either transport shares one envelope shape. The
//! wire form is a binary-packed (CBOR) map with the exact keys
//! `role`, `id`, `timestamp`, `fromWalletAddr`, `to`, `payload`,
//! `signature`; absent optional fields are omitted, never null.
//!
//! Signatures cover the canonical JSON rendering of the envelope with
//! `signature` removed (see [`crate::canonical`]), so the wire codec
//! and the signing input are deliberately decoupled.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use diiisco_types::{DiiiscoError, Result, SessionId};

use crate::canonical::canonical_json_bytes;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Message role discriminator.
///
/// The known set is closed; unrecognized wire values are preserved in
/// [`Role::Unknown`] so decode → re-encode never alters an envelope
/// (and therefore never invalidates its signature). Dispatch rejects
/// unknown roles after signature verification.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    /// Ask all providers for their model lists.
    ListModels,
    /// Reply carrying a provider's model list.
    ListModelsResponse,
    /// Ask for quotes on an inference request.
    QuoteRequest,
    /// A provider's bid for a quote request.
    QuoteResponse,
    /// Customer accepts the winning bid.
    QuoteAccepted,
    /// Provider created the on-chain escrow slot.
    ContractCreated,
    /// Customer funded the escrow.
    ContractSigned,
    /// Provider delivers the completion.
    InferenceResponse,
    /// Role string outside the closed set, preserved verbatim.
    Unknown(String),
}

/// How the egress router delivers a role.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryClass {
    /// Always published on the well-known topic.
    Broadcast,
    /// Sent on a direct stream when possible, broadcast as fallback.
    DirectPreferred,
}

impl Role {
    /// Wire string for this role.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ListModels => "list-models",
            Self::ListModelsResponse => "list-models-response",
            Self::QuoteRequest => "quote-request",
            Self::QuoteResponse => "quote-response",
            Self::QuoteAccepted => "quote-accepted",
            Self::ContractCreated => "contract-created",
            Self::ContractSigned => "contract-signed",
            Self::InferenceResponse => "inference-response",
            Self::Unknown(s) => s,
        }
    }

    /// Parses a wire string, preserving unrecognized values.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "list-models" => Self::ListModels,
            "list-models-response" => Self::ListModelsResponse,
            "quote-request" => Self::QuoteRequest,
            "quote-response" => Self::QuoteResponse,
            "quote-accepted" => Self::QuoteAccepted,
            "contract-created" => Self::ContractCreated,
            "contract-signed" => Self::ContractSigned,
            "inference-response" => Self::InferenceResponse,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Delivery taxonomy consulted by the egress router.
    ///
    /// Unknown roles are never constructed locally; they map to
    /// broadcast so a misrouted value still cannot open a stream.
    pub fn delivery_class(&self) -> DeliveryClass {
        match self {
            Self::QuoteAccepted
            | Self::ContractCreated
            | Self::ContractSigned
            | Self::InferenceResponse => DeliveryClass::DirectPreferred,
            _ => DeliveryClass::Broadcast,
        }
    }

    /// Whether this role is in the closed set.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&s))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The message envelope shared by every role and transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Envelope {
    /// Role discriminator.
    pub role: Role,
    /// Session identifier, stable across all messages of one session.
    pub id: SessionId,
    /// Sender clock, milliseconds since epoch.
    pub timestamp: u64,
    /// Ledger address of the sender; also the verification key.
    pub from_wallet_addr: String,
    /// Recipient node id; absent on broadcast-by-design roles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Role-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Base64 signature over the canonical envelope without this field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    /// Builds an unsigned envelope.
    pub fn new(
        role: Role,
        id: SessionId,
        timestamp: u64,
        from_wallet_addr: impl Into<String>,
        to: Option<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            role,
            id,
            timestamp,
            from_wallet_addr: from_wallet_addr.into(),
            to,
            payload,
            signature: None,
        }
    }

    /// Canonical JSON bytes of this envelope with `signature` removed.
    ///
    /// This is the exact input to signing and verification.
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let value = serde_json::to_value(&unsigned).map_err(|e| {
            DiiiscoError::ProtocolError {
                reason: format!("failed to render envelope as JSON: {e}"),
            }
        })?;
        canonical_json_bytes(&value)
    }

    /// Encodes the envelope into its binary-packed wire form.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| {
            DiiiscoError::ProtocolError {
                reason: format!("failed to encode envelope: {e}"),
            }
        })?;
        Ok(buf)
    }

    /// Decodes an envelope from its binary-packed wire form.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| DiiiscoError::ProtocolError {
            reason: format!("failed to decode envelope: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Session id derivation
// ---------------------------------------------------------------------------

/// Number of hex characters kept from the request digest.
const SESSION_ID_HEX_LEN: usize = 56;

/// Derives the session id for a façade-originated request:
/// first 56 hex characters of SHA-256(ms-timestamp ‖ canonical body).
pub fn derive_session_id(timestamp_ms: u64, body: &Value) -> Result<SessionId> {
    let mut hasher = Sha256::new();
    hasher.update(timestamp_ms.to_string().as_bytes());
    hasher.update(&canonical_json_bytes(body)?);
    let digest = hex::encode(hasher.finalize());
    SessionId::new(&digest[..SESSION_ID_HEX_LEN])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
