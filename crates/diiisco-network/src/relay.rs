//! Circuit relay support for NAT traversal.
//!
//! - **Relay server** — a publicly reachable node ferries encrypted
//!   streams for NATed peers, bounded by the configured caps.
//! - **Relay client** — a private node reserves a slot on a relay and
//!   listens through it, becoming dial-able at a circuit address.

use std::time::Duration;

use libp2p::relay;
use libp2p::{Multiaddr, PeerId};

use diiisco_types::{DiiiscoError, Result};

use crate::config::NetworkConfig;

// ---------------------------------------------------------------------------
// Relay server
// ---------------------------------------------------------------------------

/// Builds the relay-server behaviour when enabled.
///
/// Caps come straight from the relay section of the config:
/// reservation/circuit counts, per-circuit bytes, per-circuit
/// duration. Returns `None` when relay serving is disabled; the
/// caller wraps this in a `Toggle`.
pub fn build_relay_server_behaviour(
    local_peer_id: PeerId,
    config: &NetworkConfig,
) -> Option<relay::Behaviour> {
    if !config.enable_relay_server {
        tracing::debug!("relay server disabled");
        return None;
    }

    let relay_config = relay::Config {
        max_reservations: config.max_relayed_connections as usize,
        max_circuits: config.max_relayed_connections as usize,
        max_circuit_duration: Duration::from_secs(config.max_relay_duration),
        max_circuit_bytes: config.max_data_per_connection,
        ..relay::Config::default()
    };

    tracing::info!(
        max_relayed = config.max_relayed_connections,
        "relay server enabled"
    );
    Some(relay::Behaviour::new(local_peer_id, relay_config))
}

// ---------------------------------------------------------------------------
// Circuit address helpers
// ---------------------------------------------------------------------------

/// Builds the listen address for a reservation on a relay:
/// `{relay_addr}/p2p-circuit`.
///
/// The relay address must already carry its `/p2p/<peer-id>`
/// component (bootstrap addresses always do).
pub fn build_relay_listen_addr(relay_addr: &Multiaddr) -> Result<Multiaddr> {
    format!("{relay_addr}/p2p-circuit")
        .parse()
        .map_err(|e| DiiiscoError::NetworkError {
            reason: format!("failed to build relay listen address: {e}"),
        })
}

/// Builds a circuit address for dialing `target` through a relay:
/// `{relay_addr}/p2p-circuit/p2p/{target}`.
pub fn build_relay_circuit_addr(
    relay_addr: &Multiaddr,
    target_peer_id: &PeerId,
) -> Result<Multiaddr> {
    format!("{relay_addr}/p2p-circuit/p2p/{target_peer_id}")
        .parse()
        .map_err(|e| DiiiscoError::NetworkError {
            reason: format!("failed to build relay circuit address: {e}"),
        })
}

// ---------------------------------------------------------------------------
// Event logging
// ---------------------------------------------------------------------------

/// Logs relay client events.
pub fn log_relay_client_event(event: &relay::client::Event) {
    match event {
        relay::client::Event::ReservationReqAccepted {
            relay_peer_id,
            renewal,
            ..
        } => {
            tracing::info!(%relay_peer_id, renewal, "relay reservation accepted");
        }
        relay::client::Event::OutboundCircuitEstablished { relay_peer_id, .. } => {
            tracing::info!(%relay_peer_id, "outbound relay circuit established");
        }
        relay::client::Event::InboundCircuitEstablished { src_peer_id, .. } => {
            tracing::info!(%src_peer_id, "inbound relay circuit established");
        }
        other => {
            tracing::debug!(?other, "relay client event");
        }
    }
}

/// Logs relay server events.
pub fn log_relay_server_event(event: &relay::Event) {
    match event {
        relay::Event::ReservationReqAccepted {
            src_peer_id,
            renewed,
        } => {
            tracing::info!(%src_peer_id, renewed, "relay server: reservation accepted");
        }
        relay::Event::ReservationReqDenied { src_peer_id } => {
            tracing::warn!(%src_peer_id, "relay server: reservation denied");
        }
        relay::Event::CircuitReqAccepted {
            src_peer_id,
            dst_peer_id,
        } => {
            tracing::info!(%src_peer_id, %dst_peer_id, "relay server: circuit accepted");
        }
        relay::Event::CircuitReqDenied {
            src_peer_id,
            dst_peer_id,
        } => {
            tracing::warn!(%src_peer_id, %dst_peer_id, "relay server: circuit denied");
        }
        relay::Event::CircuitClosed {
            src_peer_id,
            dst_peer_id,
            error,
        } => {
            tracing::debug!(%src_peer_id, %dst_peer_id, ?error, "relay server: circuit closed");
        }
        _ => {
            tracing::trace!(?event, "relay server event");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
