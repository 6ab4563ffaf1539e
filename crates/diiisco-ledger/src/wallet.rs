//! Local wallet: the Ed25519 key-pair behind `fromWalletAddr`.
//!
//! The wallet signs canonical envelope bytes and derives the node's
//! ledger address. Key material comes from the configured secret
//! phrase; SDK-backed deployments substitute their own wallet tooling
//! behind the same surface.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512_256};

use diiisco_protocol::canonical::canonical_json_bytes;
use diiisco_types::config::AlgorandConfig;
use diiisco_types::{DiiiscoError, Result, WalletAddr};

/// Ed25519 wallet owning the node's ledger identity.
pub struct Wallet {
    signing_key: SigningKey,
    addr: WalletAddr,
}

impl Wallet {
    /// Builds a wallet from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let addr = WalletAddr::from_public_key(&signing_key.verifying_key().to_bytes());
        Self { signing_key, addr }
    }

    /// Derives a deterministic wallet from the configured secret phrase.
    ///
    /// The phrase is whitespace-normalized and hashed with SHA-512/256
    /// into the signing seed. Deployments that manage chain accounts
    /// with external wallet tooling implement [`crate::LedgerClient`]
    /// themselves and bypass this derivation.
    pub fn from_entropy_phrase(phrase: &str) -> Self {
        let normalized = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
        let digest = Sha512_256::digest(normalized.as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        Self::from_seed(&seed)
    }

    /// Generates a throwaway wallet from the OS RNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Builds the wallet from the ledger section of the config.
    ///
    /// The mnemonic is required; a configured `addr` that does not
    /// match the derived address is a fatal configuration error.
    pub fn from_config(config: &AlgorandConfig) -> Result<Self> {
        let phrase = config
            .mnemonic
            .as_deref()
            .ok_or_else(|| DiiiscoError::MissingConfig {
                key: "algorand.mnemonic".into(),
            })?;
        let wallet = Self::from_entropy_phrase(phrase);

        if let Some(expected) = config.addr.as_deref() {
            if expected != wallet.addr.as_str() {
                return Err(DiiiscoError::ConfigError {
                    reason: format!(
                        "algorand.addr {} does not match the mnemonic-derived address {}",
                        expected, wallet.addr
                    ),
                });
            }
        }

        Ok(wallet)
    }

    /// The wallet's ledger address.
    pub fn address(&self) -> &WalletAddr {
        &self.addr
    }

    /// The signing key, for envelope signing.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Signs arbitrary bytes, returning the base64 signature.
    pub fn sign_bytes(&self, bytes: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(bytes).to_bytes())
    }

    /// Signs a JSON object over its canonical encoding.
    pub fn sign_object(&self, value: &serde_json::Value) -> Result<String> {
        Ok(self.sign_bytes(&canonical_json_bytes(value)?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seed_derivation_is_deterministic() {
        let a = Wallet::from_seed(&[0x11; 32]);
        let b = Wallet::from_seed(&[0x11; 32]);
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn phrase_whitespace_is_normalized() {
        let a = Wallet::from_entropy_phrase("alpha bravo charlie");
        let b = Wallet::from_entropy_phrase("  alpha   bravo\tcharlie ");
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn distinct_phrases_distinct_addresses() {
        let a = Wallet::from_entropy_phrase("alpha");
        let b = Wallet::from_entropy_phrase("bravo");
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn address_recovers_verifying_key() {
        let wallet = Wallet::from_seed(&[0x22; 32]);
        let pk = wallet.address().public_key().unwrap();
        assert_eq!(pk, wallet.signing_key().verifying_key().to_bytes());
    }

    #[test]
    fn config_requires_mnemonic() {
        let config = AlgorandConfig::default();
        assert!(matches!(
            Wallet::from_config(&config),
            Err(DiiiscoError::MissingConfig { .. })
        ));
    }

    #[test]
    fn config_addr_mismatch_rejected() {
        let config = AlgorandConfig {
            mnemonic: Some("alpha".into()),
            addr: Some("WRONGADDRESS".into()),
            ..AlgorandConfig::default()
        };
        assert!(matches!(
            Wallet::from_config(&config),
            Err(DiiiscoError::ConfigError { .. })
        ));
    }

    #[test]
    fn config_addr_match_accepted() {
        let derived = Wallet::from_entropy_phrase("alpha");
        let config = AlgorandConfig {
            mnemonic: Some("alpha".into()),
            addr: Some(derived.address().as_str().to_string()),
            ..AlgorandConfig::default()
        };
        assert!(Wallet::from_config(&config).is_ok());
    }

    #[test]
    fn sign_object_is_deterministic() {
        let wallet = Wallet::from_seed(&[0x33; 32]);
        let value = json!({ "b": 1, "a": 2 });
        let reordered: serde_json::Value =
            serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(
            wallet.sign_object(&value).unwrap(),
            wallet.sign_object(&reordered).unwrap()
        );
    }
}
