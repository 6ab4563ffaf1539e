//! Application configuration for a diiisco node.
//!
//! All values have documented defaults so an empty config file yields a
//! working customer-mode node. Unknown keys are rejected at load
//! (`deny_unknown_fields`) so typos surface at startup rather than as
//! silently-ignored settings.

use serde::{Deserialize, Serialize};

use crate::{DiiiscoError, Result};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default libp2p listen port.
pub const DEFAULT_NODE_PORT: u16 = 8777;

/// Default HTTP façade port.
pub const DEFAULT_API_PORT: u16 = 8080;

/// Default per-stream abort timeout for direct messaging (ms).
pub const DEFAULT_DIRECT_TIMEOUT_MS: u64 = 10_000;

/// Default direct-protocol frame cap (10 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default direct messaging protocol id.
pub const DEFAULT_DIRECT_PROTOCOL: &str = "/diiisco/direct/1.0.0";

/// Default auction window (ms).
pub const DEFAULT_QUOTE_WAIT_MS: u64 = 5_000;

/// Well-known pub/sub topic carrying all broadcast traffic.
pub const WELL_KNOWN_TOPIC: &str = "diiisco/models/1.0.0";

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Top-level node configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AppConfig {
    /// Listen port and advertised host.
    pub node: NodeConfig,
    /// Bootstrap addresses or registry aliases.
    pub libp2p_bootstrap_servers: Vec<String>,
    /// Relay and hole-punch settings.
    pub relay: RelayConfig,
    /// Direct messaging protocol settings.
    pub direct_messaging: DirectMessagingConfig,
    /// Quote auction settings.
    pub quote_engine: QuoteEngineConfig,
    /// Provider-mode model runtime settings.
    pub models: ModelsConfig,
    /// Ledger identity and endpoint.
    pub algorand: AlgorandConfig,
    /// HTTP façade settings.
    pub api: ApiConfig,
}

/// Listen port and advertised host.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct NodeConfig {
    /// TCP port the swarm listens on.
    pub port: u16,
    /// Advertised host (ip4 or dns4 name).
    pub url: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_NODE_PORT,
            url: "0.0.0.0".into(),
        }
    }
}

/// Relay and NAT traversal settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RelayConfig {
    /// Advertise relay-server capability when publicly reachable.
    pub enable_relay_server: bool,
    /// Accept being dialed through relays when behind a NAT.
    pub enable_relay_client: bool,
    /// Upgrade relayed streams to direct connections via hole punching.
    #[serde(rename = "enableDCUtR")]
    pub enable_dcutr: bool,
    /// Maximum concurrent relayed connections served.
    pub max_relayed_connections: u32,
    /// Per-circuit data cap in bytes.
    pub max_data_per_connection: u64,
    /// Per-circuit duration cap in seconds.
    pub max_relay_duration: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enable_relay_server: true,
            enable_relay_client: true,
            enable_dcutr: true,
            max_relayed_connections: 16,
            max_data_per_connection: 1 << 20,
            max_relay_duration: 120,
        }
    }
}

/// Direct messaging protocol settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DirectMessagingConfig {
    /// Gate on the direct protocol; when false everything broadcasts.
    pub enabled: bool,
    /// Per-stream abort timeout in milliseconds.
    pub timeout: u64,
    /// Republish on the well-known topic when a direct send fails.
    pub fallback_to_gossipsub: bool,
    /// Protocol id served by the direct handler.
    pub protocol: String,
    /// Frame cap enforced on the reader.
    pub max_message_size: usize,
}

impl Default for DirectMessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: DEFAULT_DIRECT_TIMEOUT_MS,
            fallback_to_gossipsub: true,
            protocol: DEFAULT_DIRECT_PROTOCOL.into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Winner selection policy for the quote auction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Minimum total price; ties broken by arrival order.
    #[default]
    Cheapest,
    /// Earliest arrival.
    First,
    /// Uniform random choice.
    Random,
    /// Highest protocol-asset balance; ties broken by arrival order.
    HighestStake,
}

/// Quote auction settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct QuoteEngineConfig {
    /// Auction window in milliseconds.
    pub wait_time: u64,
    /// Winner selection policy.
    pub quote_selection_function: SelectionPolicy,
    /// Ordered pricing pipeline; first entry producing a quote wins.
    pub quote_creation_function: Vec<String>,
}

impl Default for QuoteEngineConfig {
    fn default() -> Self {
        Self {
            wait_time: DEFAULT_QUOTE_WAIT_MS,
            quote_selection_function: SelectionPolicy::Cheapest,
            quote_creation_function: vec!["embedding-rate".into()],
        }
    }
}

/// Provider-mode model runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ModelsConfig {
    /// Serve models (provider mode).
    pub enabled: bool,
    /// Base URL of the OpenAI-compatible runtime.
    #[serde(rename = "baseURL")]
    pub base_url: String,
    /// Runtime port, appended to `base_url` when non-zero.
    pub port: u16,
    /// Bearer key for the runtime, if it requires one.
    pub api_key: Option<String>,
    /// Price charged per one million tokens, in USDC.
    #[serde(rename = "chargePer1MTokens")]
    pub charge_per_1m_tokens: f64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost".into(),
            port: 11434,
            api_key: None,
            charge_per_1m_tokens: 0.02,
        }
    }
}

/// Ledger identity and endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AlgorandConfig {
    /// Wallet address; derived from the mnemonic when omitted.
    pub addr: Option<String>,
    /// Wallet secret phrase.
    pub mnemonic: Option<String>,
    /// Target network name, e.g. `testnet`.
    pub network: String,
    /// Ledger endpoint settings.
    pub client: AlgodClientConfig,
    /// Protocol asset id used for escrow payments.
    pub asset_id: u64,
}

/// Ledger endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AlgodClientConfig {
    /// Endpoint URL.
    pub url: String,
    /// Endpoint port.
    pub port: u16,
    /// API token, if the endpoint requires one.
    pub token: Option<String>,
}

impl Default for AlgodClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost".into(),
            port: 4001,
            token: None,
        }
    }
}

/// HTTP façade settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ApiConfig {
    /// Serve the HTTP façade.
    pub enabled: bool,
    /// Façade listen port.
    pub port: u16,
    /// Require a bearer token on `/v1/*` and `/peers`.
    pub bearer_authentication: bool,
    /// Accepted bearer tokens.
    pub keys: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_API_PORT,
            bearer_authentication: false,
            keys: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Validates the configuration, returning the first problem found.
    ///
    /// Fatal at start-up: a node must not come up with a config it
    /// cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.direct_messaging.timeout == 0 {
            return Err(DiiiscoError::ConfigError {
                reason: "directMessaging.timeout must be greater than 0".into(),
            });
        }
        if self.direct_messaging.max_message_size == 0 {
            return Err(DiiiscoError::ConfigError {
                reason: "directMessaging.maxMessageSize must be greater than 0".into(),
            });
        }
        if !self.direct_messaging.protocol.starts_with('/') {
            return Err(DiiiscoError::ConfigError {
                reason: "directMessaging.protocol must start with '/'".into(),
            });
        }
        if self.quote_engine.wait_time == 0 {
            return Err(DiiiscoError::ConfigError {
                reason: "quoteEngine.waitTime must be greater than 0".into(),
            });
        }
        if self.models.enabled {
            if self.models.base_url.is_empty() {
                return Err(DiiiscoError::MissingConfig {
                    key: "models.baseURL".into(),
                });
            }
            if self.models.charge_per_1m_tokens < 0.0 {
                return Err(DiiiscoError::ConfigError {
                    reason: "models.chargePer1MTokens must not be negative".into(),
                });
            }
            if self.quote_engine.quote_creation_function.is_empty() {
                return Err(DiiiscoError::MissingConfig {
                    key: "quoteEngine.quoteCreationFunction".into(),
                });
            }
        }
        if self.api.enabled && self.api.bearer_authentication && self.api.keys.is_empty() {
            return Err(DiiiscoError::MissingConfig {
                key: "api.keys".into(),
            });
        }
        if self.algorand.mnemonic.is_none() && self.algorand.addr.is_none() {
            return Err(DiiiscoError::MissingConfig {
                key: "algorand.mnemonic".into(),
            });
        }
        Ok(())
    }

    /// Effective model runtime URL (`base_url` with the port applied).
    pub fn model_runtime_url(&self) -> String {
        if self.models.port == 0 {
            self.models.base_url.trim_end_matches('/').to_string()
        } else {
            format!(
                "{}:{}",
                self.models.base_url.trim_end_matches('/'),
                self.models.port
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            algorand: AlgorandConfig {
                mnemonic: Some("test phrase".into()),
                ..AlgorandConfig::default()
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn default_with_mnemonic_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn missing_wallet_identity_rejected() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate(),
            Err(DiiiscoError::MissingConfig { .. })
        ));
    }

    #[test]
    fn zero_direct_timeout_rejected() {
        let mut config = valid_config();
        config.direct_messaging.timeout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_wait_time_rejected() {
        let mut config = valid_config();
        config.quote_engine.wait_time = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn protocol_without_slash_rejected() {
        let mut config = valid_config();
        config.direct_messaging.protocol = "diiisco/direct/1.0.0".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_mode_requires_base_url() {
        let mut config = valid_config();
        config.models.enabled = true;
        config.models.base_url = String::new();
        assert!(matches!(
            config.validate(),
            Err(DiiiscoError::MissingConfig { .. })
        ));
    }

    #[test]
    fn bearer_auth_requires_keys() {
        let mut config = valid_config();
        config.api.bearer_authentication = true;
        config.api.keys.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_rejected_at_load() {
        let json = r#"{ "node": { "port": 9000 }, "nodeExtra": true }"#;
        let parsed: std::result::Result<AppConfig, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn nested_unknown_keys_rejected() {
        let json = r#"{ "directMessaging": { "enabled": true, "retries": 3 } }"#;
        let parsed: std::result::Result<AppConfig, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn relay_and_model_keys_use_exact_spelling() {
        let json = r#"{
            "relay": { "enableDCUtR": false },
            "models": { "baseURL": "http://runtime" }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert!(!config.relay.enable_dcutr);
        assert_eq!(config.models.base_url, "http://runtime");
    }

    #[test]
    fn selection_policy_parses_kebab_case() {
        let policy: SelectionPolicy = serde_json::from_str("\"highest-stake\"").unwrap();
        assert_eq!(policy, SelectionPolicy::HighestStake);
    }

    #[test]
    fn charge_key_uses_exact_spelling() {
        let json = r#"{ "models": { "chargePer1MTokens": 0.017 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert!((config.models.charge_per_1m_tokens - 0.017).abs() < f64::EPSILON);
    }

    #[test]
    fn model_runtime_url_applies_port() {
        let mut config = valid_config();
        config.models.base_url = "http://localhost/".into();
        config.models.port = 11434;
        assert_eq!(config.model_runtime_url(), "http://localhost:11434");
        config.models.port = 0;
        assert_eq!(config.model_runtime_url(), "http://localhost");
    }
}
