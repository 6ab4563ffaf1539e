//! Network configuration for the diiisco libp2p layer.
//!
//! Built from the application config at boot (bootstrap aliases are
//! resolved through the ledger registry before this struct exists, so
//! everything here is a concrete multiaddr). All values have
//! documented defaults; validation runs at startup.

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;

use diiisco_types::config::AppConfig;
use diiisco_types::{DiiiscoError, Result};

/// Network-layer configuration.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    // -----------------------------------------------------------------------
    // Core networking
    // -----------------------------------------------------------------------
    /// Multiaddr this node listens on.
    pub listen_addr: Multiaddr,

    /// Resolved bootstrap multiaddrs (aliases already resolved).
    pub bootstrap_nodes: Vec<Multiaddr>,

    /// Advertised external address, built from the configured host.
    pub advertise_addr: Option<Multiaddr>,

    /// Connection floor the supervisor tries to stay above.
    pub min_connections: usize,

    /// Hard ceiling on simultaneous established connections.
    pub max_connections: usize,

    /// Inbound count above which eviction prefers unused inbound
    /// connections.
    pub inbound_connection_threshold: usize,

    /// Seconds before an idle connection is closed by the swarm.
    pub idle_timeout_secs: u64,

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------
    /// Enable mDNS auto-discovery on the local network.
    pub enable_mdns: bool,

    // -----------------------------------------------------------------------
    // Keep-alive
    // -----------------------------------------------------------------------
    /// Application-level ping interval in seconds.
    pub keep_alive_interval_secs: u64,

    /// Per-ping timeout in seconds.
    pub keep_alive_timeout_secs: u64,

    // -----------------------------------------------------------------------
    // Pub/sub
    // -----------------------------------------------------------------------
    /// The well-known topic carrying all broadcast traffic.
    pub topic: String,

    // -----------------------------------------------------------------------
    // Direct messaging
    // -----------------------------------------------------------------------
    /// Direct protocol id.
    pub direct_protocol: String,

    /// Per-stream abort timeout in milliseconds.
    pub direct_timeout_ms: u64,

    /// Frame cap enforced before allocation on the reader.
    pub max_message_size: usize,

    // -----------------------------------------------------------------------
    // NAT traversal
    // -----------------------------------------------------------------------
    /// Serve as a relay for NATed peers when publicly reachable.
    pub enable_relay_server: bool,

    /// Accept being dialed through relays.
    pub enable_relay_client: bool,

    /// Upgrade relayed connections to direct via hole punching.
    pub enable_dcutr: bool,

    /// Relay-server cap on concurrent reservations/circuits.
    pub max_relayed_connections: u32,

    /// Relay-server per-circuit byte cap.
    pub max_data_per_connection: u64,

    /// Relay-server per-circuit duration cap in seconds.
    pub max_relay_duration: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        // Built without parsing so no fallible call hides in a default.
        let mut listen_addr = Multiaddr::empty();
        listen_addr.push(Protocol::Ip4(std::net::Ipv4Addr::UNSPECIFIED));
        listen_addr.push(Protocol::Tcp(diiisco_types::config::DEFAULT_NODE_PORT));

        Self {
            listen_addr,
            bootstrap_nodes: Vec::new(),
            advertise_addr: None,
            min_connections: 2,
            max_connections: 100,
            inbound_connection_threshold: 32,
            idle_timeout_secs: 120,
            enable_mdns: true,
            keep_alive_interval_secs: 30,
            keep_alive_timeout_secs: 10,
            topic: diiisco_types::config::WELL_KNOWN_TOPIC.into(),
            direct_protocol: diiisco_types::config::DEFAULT_DIRECT_PROTOCOL.into(),
            direct_timeout_ms: diiisco_types::config::DEFAULT_DIRECT_TIMEOUT_MS,
            max_message_size: diiisco_types::config::DEFAULT_MAX_MESSAGE_SIZE,
            enable_relay_server: true,
            enable_relay_client: true,
            enable_dcutr: true,
            max_relayed_connections: 16,
            max_data_per_connection: 1 << 20,
            max_relay_duration: 120,
        }
    }
}

impl NetworkConfig {
    /// Builds the network config from the application config plus the
    /// already-resolved bootstrap addresses.
    pub fn from_app(app: &AppConfig, bootstrap_nodes: Vec<Multiaddr>) -> Result<Self> {
        let mut listen_addr = Multiaddr::empty();
        listen_addr.push(Protocol::Ip4(std::net::Ipv4Addr::UNSPECIFIED));
        listen_addr.push(Protocol::Tcp(app.node.port));

        let config = Self {
            listen_addr,
            bootstrap_nodes,
            advertise_addr: advertise_addr(&app.node.url, app.node.port),
            topic: diiisco_types::config::WELL_KNOWN_TOPIC.into(),
            direct_protocol: app.direct_messaging.protocol.clone(),
            direct_timeout_ms: app.direct_messaging.timeout,
            max_message_size: app.direct_messaging.max_message_size,
            enable_relay_server: app.relay.enable_relay_server,
            enable_relay_client: app.relay.enable_relay_client,
            enable_dcutr: app.relay.enable_dcutr,
            max_relayed_connections: app.relay.max_relayed_connections,
            max_data_per_connection: app.relay.max_data_per_connection,
            max_relay_duration: app.relay.max_relay_duration,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates all values, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(DiiiscoError::ConfigError {
                reason: "max_connections must be greater than 0".into(),
            });
        }
        if self.min_connections > self.max_connections {
            return Err(DiiiscoError::ConfigError {
                reason: "min_connections must not exceed max_connections".into(),
            });
        }
        if self.keep_alive_interval_secs == 0 {
            return Err(DiiiscoError::ConfigError {
                reason: "keep_alive_interval_secs must be greater than 0".into(),
            });
        }
        if self.keep_alive_timeout_secs == 0 {
            return Err(DiiiscoError::ConfigError {
                reason: "keep_alive_timeout_secs must be greater than 0".into(),
            });
        }
        if self.direct_timeout_ms == 0 {
            return Err(DiiiscoError::ConfigError {
                reason: "direct_timeout_ms must be greater than 0".into(),
            });
        }
        if self.max_message_size == 0 {
            return Err(DiiiscoError::ConfigError {
                reason: "max_message_size must be greater than 0".into(),
            });
        }
        if !self.direct_protocol.starts_with('/') {
            return Err(DiiiscoError::ConfigError {
                reason: "direct_protocol must start with '/'".into(),
            });
        }
        if self.topic.is_empty() {
            return Err(DiiiscoError::ConfigError {
                reason: "topic must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Builds the advertised multiaddr from the configured host.
///
/// An unspecified or wildcard host advertises nothing — AutoNAT will
/// discover the external address instead.
fn advertise_addr(host: &str, port: u16) -> Option<Multiaddr> {
    let host = host.trim();
    if host.is_empty() || host == "0.0.0.0" {
        return None;
    }

    let mut addr = Multiaddr::empty();
    match host.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => addr.push(Protocol::Ip4(ip)),
        Err(_) => addr.push(Protocol::Dns4(host.into())),
    }
    addr.push(Protocol::Tcp(port));
    Some(addr)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_connections_rejected() {
        let config = NetworkConfig {
            max_connections: 0,
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn min_above_max_rejected() {
        let config = NetworkConfig {
            min_connections: 200,
            max_connections: 100,
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_keep_alive_rejected() {
        let config = NetworkConfig {
            keep_alive_interval_secs: 0,
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn protocol_without_slash_rejected() {
        let config = NetworkConfig {
            direct_protocol: "diiisco/direct/1.0.0".into(),
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_app_carries_direct_settings() {
        let mut app = AppConfig::default();
        app.node.port = 9000;
        app.direct_messaging.max_message_size = 1024;
        let config = NetworkConfig::from_app(&app, Vec::new()).unwrap();
        assert_eq!(config.max_message_size, 1024);
        assert!(config.listen_addr.to_string().contains("/tcp/9000"));
    }

    #[test]
    fn wildcard_host_advertises_nothing() {
        assert!(advertise_addr("0.0.0.0", 8777).is_none());
        assert!(advertise_addr("", 8777).is_none());
    }

    #[test]
    fn ip_host_advertises_ip4() {
        let addr = advertise_addr("203.0.113.7", 8777).unwrap();
        assert_eq!(addr.to_string(), "/ip4/203.0.113.7/tcp/8777");
    }

    #[test]
    fn name_host_advertises_dns4() {
        let addr = advertise_addr("node.example.org", 8777).unwrap();
        assert_eq!(addr.to_string(), "/dns4/node.example.org/tcp/8777");
    }
}
