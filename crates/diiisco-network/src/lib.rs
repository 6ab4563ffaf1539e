//! diiisco libp2p network layer.
//!
//! Provides the node identity store, encrypted multiplexed transport,
//! local-network discovery, pub/sub broadcast, the one-shot direct
//! messaging protocol, and NAT traversal (AutoNAT + relay + DCUtR).
//!
//! # Architecture
//!
//! - [`identity`] — load/create the persistent node key-pair
//! - [`transport`] — TCP transport with Noise encryption
//! - [`gossip`] — well-known topic pub/sub
//! - [`direct`] — length-prefixed one-message-per-stream protocol
//! - [`nat`] — reachability probing
//! - [`relay`] — relay server/client helpers
//! - [`hole_punch`] — DCUtR upgrade handling
//! - [`swarm`] — high-level swarm wrapper with event fan-out
//! - [`config`] — network configuration with defaults

pub mod config;
pub mod direct;
pub mod events;
pub mod gossip;
pub mod hole_punch;
pub mod identity;
pub mod nat;
pub mod relay;
pub mod swarm;
pub mod transport;

pub use config::NetworkConfig;
pub use events::{NetworkEvent, TransportKind};
pub use nat::Reachability;
pub use swarm::DiiiscoSwarm;
