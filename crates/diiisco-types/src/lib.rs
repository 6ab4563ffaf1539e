//! Core shared types for the diiisco inference marketplace.
//!
//! This crate defines the fundamental types used across the workspace.
//! No other crate should define shared types — everything lives here.

pub mod config;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512_256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Identifier shared by every message of one inference session.
///
/// Façade-originated sessions use the first 56 hex characters of a
/// SHA-256 over the request timestamp and body; remote peers may use
/// any non-empty opaque string up to [`SessionId::MAX_LEN`] bytes.
/// The same bounds hold on deserialization, so no empty or oversized
/// id ever enters from the wire.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl SessionId {
    /// Maximum accepted length in bytes.
    pub const MAX_LEN: usize = 128;

    /// Creates a session id, rejecting empty or oversized values.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(DiiiscoError::ProtocolError {
                reason: "session id must not be empty".into(),
            });
        }
        if id.len() > Self::MAX_LEN {
            return Err(DiiiscoError::ProtocolError {
                reason: format!(
                    "session id exceeds {} bytes ({})",
                    Self::MAX_LEN,
                    id.len()
                ),
            });
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = DiiiscoError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// WalletAddr
// ---------------------------------------------------------------------------

/// Base32 alphabet (RFC 4648, no padding) used by ledger addresses.
const B32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Ledger public address: base32 of the Ed25519 public key followed by
/// a 4-byte SHA-512/256 checksum.
///
/// The address doubles as the signature verification key — decoding it
/// recovers the exact 32-byte public key of the signer.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletAddr(String);

impl WalletAddr {
    /// Encoded length of a well-formed address (36 bytes → 58 chars).
    pub const LEN: usize = 58;

    /// Encodes a 32-byte Ed25519 public key into its ledger address.
    pub fn from_public_key(pk: &[u8; 32]) -> Self {
        let mut data = [0u8; 36];
        data[..32].copy_from_slice(pk);
        data[32..].copy_from_slice(&checksum(pk));
        Self(b32_encode(&data))
    }

    /// Decodes the address back into the 32-byte public key,
    /// verifying the checksum.
    pub fn public_key(&self) -> Result<[u8; 32]> {
        let bytes = b32_decode(&self.0).ok_or_else(|| DiiiscoError::BadSender {
            addr: self.0.clone(),
        })?;
        if bytes.len() < 36 {
            return Err(DiiiscoError::BadSender {
                addr: self.0.clone(),
            });
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&bytes[..32]);
        if bytes[32..36] != checksum(&pk) {
            return Err(DiiiscoError::BadSender {
                addr: self.0.clone(),
            });
        }
        Ok(pk)
    }

    /// Returns whether a string is a well-formed ledger address.
    pub fn is_valid(s: &str) -> bool {
        s.len() == Self::LEN && Self(s.to_string()).public_key().is_ok()
    }

    /// Returns the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WalletAddr {
    type Err = DiiiscoError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if !Self::is_valid(s) {
            return Err(DiiiscoError::BadSender { addr: s.into() });
        }
        Ok(Self(s.into()))
    }
}

/// Last 4 bytes of SHA-512/256 over the public key.
fn checksum(pk: &[u8; 32]) -> [u8; 4] {
    let digest = Sha512_256::digest(pk);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[28..32]);
    out
}

/// RFC 4648 base32 encoding without padding.
fn b32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buf: u32 = 0;
    let mut bits = 0u32;
    for &b in data {
        buf = (buf << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(B32_ALPHABET[((buf >> bits) & 31) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(B32_ALPHABET[((buf << (5 - bits)) & 31) as usize] as char);
    }
    out
}

/// RFC 4648 base32 decoding without padding.
///
/// Returns `None` on any character outside the alphabet.
fn b32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buf: u32 = 0;
    let mut bits = 0u32;
    for c in s.bytes() {
        let v = match c {
            b'A'..=b'Z' => c - b'A',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buf = (buf << 5) | u32::from(v);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buf >> bits) as u8);
        }
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// ModelInfo / ChatMessage
// ---------------------------------------------------------------------------

/// A model served by a provider, in the OpenAI list shape.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier, e.g. `gpt-oss:20b`.
    pub id: String,
    /// Always `"model"`.
    #[serde(default = "default_model_object")]
    pub object: String,
    /// Creation time in seconds since epoch, if reported.
    #[serde(default)]
    pub created: u64,
    /// Owning organization, as reported by the runtime.
    #[serde(default)]
    pub owned_by: String,
}

fn default_model_object() -> String {
    "model".into()
}

/// One entry of the chat message array.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ---------------------------------------------------------------------------
// DialErrorKind
// ---------------------------------------------------------------------------

/// Classification of a failed outbound dial.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DialErrorKind {
    /// No route to the peer (no address worked).
    Unreachable,
    /// The dial attempt timed out.
    Timeout,
    /// The remote actively refused the connection.
    Refused,
}

impl fmt::Display for DialErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Refused => write!(f, "refused"),
        }
    }
}

// ---------------------------------------------------------------------------
// DiiiscoError
// ---------------------------------------------------------------------------

/// Central error type for the diiisco workspace.
///
/// All crates convert their internal errors into variants of this
/// enum. Variants follow the error taxonomy: transient transport,
/// message rejection, business rejection, session failure, and
/// configuration/boot errors.
#[derive(Debug, Error)]
pub enum DiiiscoError {
    // --- Configuration / boot (fatal at start-up) -------------------------
    /// A configuration value is invalid.
    #[error("config error: {reason}")]
    ConfigError {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// A required configuration key is absent.
    #[error("missing config: {key}")]
    MissingConfig {
        /// Dotted path of the missing key.
        key: String,
    },

    /// The identity file exists but cannot be parsed.
    #[error("identity file corrupt: {reason}")]
    IdentityCorrupt {
        /// Parse failure detail.
        reason: String,
    },

    /// The identity in use does not match the persisted identity file.
    #[error("identity mismatch between memory and identity file")]
    IdentityMismatch,

    // --- Transient transport (never fatal) ---------------------------------
    /// A networking or transport operation failed.
    #[error("network error: {reason}")]
    NetworkError {
        /// Failure detail.
        reason: String,
    },

    /// An outbound dial failed.
    #[error("dial failed ({kind}): {reason}")]
    DialFailed {
        /// Unreachable, timeout, or refused.
        kind: DialErrorKind,
        /// Original cause.
        reason: String,
    },

    /// The pub/sub mesh did not reach the required size in time.
    #[error("no mesh: needed {needed} subscribed peer(s)")]
    NoMesh {
        /// Minimum subscriber count that was awaited.
        needed: usize,
    },

    // --- Message rejection (logged and dropped, never replied to) ----------
    /// A direct-protocol frame exceeded the configured size cap.
    #[error("oversize frame: {size} bytes exceeds limit {limit}")]
    OversizeFrame {
        /// Declared frame size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The sender wallet address is malformed.
    #[error("bad sender address: {addr}")]
    BadSender {
        /// The offending address string.
        addr: String,
    },

    /// The envelope carries no signature.
    #[error("unsigned envelope")]
    Unsigned,

    /// Signature verification against the sender address failed.
    #[error("bad signature")]
    BadSignature,

    /// The envelope role is outside the closed set.
    #[error("unknown role: {role}")]
    UnknownRole {
        /// The unrecognized discriminator.
        role: String,
    },

    /// The envelope is addressed to a different node.
    #[error("message not addressed to this node")]
    NotAddressedHere,

    // --- Business rejection (logged, no reply) -----------------------------
    /// The requester is not opted in to the protocol asset.
    #[error("sender not opted in to protocol asset: {addr}")]
    NotOptedIn {
        /// Wallet address that failed the opt-in check.
        addr: String,
    },

    /// No entry of the pricing pipeline produced a quote.
    #[error("no quote produced by pricing pipeline")]
    NoQuoteProduced,

    /// The requested model is not served locally.
    #[error("model not served: {model}")]
    ModelNotServed {
        /// Requested model id.
        model: String,
    },

    // --- Session failure (session dropped) ---------------------------------
    /// The on-chain escrow holds less than the quoted total.
    #[error("contract underfunded: {funded} < {required} base units")]
    Underfunded {
        /// Funded amount in USDC base units.
        funded: u64,
        /// Required amount in USDC base units.
        required: u64,
    },

    /// The model collaborator failed to produce a completion.
    #[error("inference failed: {reason}")]
    InferenceFailed {
        /// Failure detail.
        reason: String,
    },

    /// A ledger collaborator call failed.
    #[error("ledger call failed: {reason}")]
    LedgerFailed {
        /// Failure detail.
        reason: String,
    },

    /// A message could not be delivered on any transport.
    #[error("delivery failed: {reason}")]
    DeliveryFailed {
        /// Failure detail.
        reason: String,
    },

    /// A session transition or correlation is invalid.
    #[error("session error: {reason}")]
    SessionError {
        /// Failure detail.
        reason: String,
    },

    // --- Protocol ----------------------------------------------------------
    /// Encoding, decoding, or schema failure at the protocol layer.
    #[error("protocol error: {reason}")]
    ProtocolError {
        /// Failure detail.
        reason: String,
    },
}

/// Convenience result type using [`DiiiscoError`].
pub type Result<T> = std::result::Result<T, DiiiscoError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_addr_roundtrip() {
        let pk = [0x7Au8; 32];
        let addr = WalletAddr::from_public_key(&pk);
        assert_eq!(addr.as_str().len(), WalletAddr::LEN);
        assert_eq!(addr.public_key().unwrap(), pk);
    }

    #[test]
    fn wallet_addr_is_valid_accepts_encoded() {
        let addr = WalletAddr::from_public_key(&[0x01; 32]);
        assert!(WalletAddr::is_valid(addr.as_str()));
    }

    #[test]
    fn wallet_addr_rejects_bad_checksum() {
        let addr = WalletAddr::from_public_key(&[0x02; 32]);
        // Flip one character in the checksum region.
        let mut s: Vec<char> = addr.as_str().chars().collect();
        let last = s.len() - 1;
        s[last] = if s[last] == 'A' { 'B' } else { 'A' };
        let tampered: String = s.into_iter().collect();
        assert!(!WalletAddr::is_valid(&tampered));
    }

    #[test]
    fn wallet_addr_rejects_wrong_length() {
        assert!(!WalletAddr::is_valid("ABCDEF"));
        assert!(!WalletAddr::is_valid(""));
    }

    #[test]
    fn wallet_addr_rejects_non_alphabet_chars() {
        let addr = WalletAddr::from_public_key(&[0x03; 32]);
        let lowered = addr.as_str().to_lowercase();
        assert!(!WalletAddr::is_valid(&lowered));
    }

    #[test]
    fn wallet_addr_distinct_keys_distinct_addrs() {
        let a = WalletAddr::from_public_key(&[0x01; 32]);
        let b = WalletAddr::from_public_key(&[0x02; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn b32_roundtrip_various_lengths() {
        for len in [0usize, 1, 4, 5, 31, 36] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let encoded = b32_encode(&data);
            let decoded = b32_decode(&encoded).unwrap();
            assert_eq!(decoded[..data.len()], data[..]);
        }
    }

    #[test]
    fn session_id_rejects_empty() {
        assert!(SessionId::new("").is_err());
    }

    #[test]
    fn session_id_rejects_oversized() {
        let long = "a".repeat(SessionId::MAX_LEN + 1);
        assert!(SessionId::new(long).is_err());
    }

    #[test]
    fn session_id_roundtrips_via_serde() {
        let id = SessionId::new("deadbeef").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn session_id_rejects_empty_on_deserialize() {
        let result: std::result::Result<SessionId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn error_display_contains_context() {
        let err = DiiiscoError::OversizeFrame {
            size: 11,
            limit: 10,
        };
        assert!(err.to_string().contains("11"));
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn now_millis_is_plausible() {
        // 2020-01-01 in ms.
        assert!(now_millis() > 1_577_836_800_000);
    }
}
