//! Well-known topic pub/sub.
//!
//! All broadcast traffic rides one gossipsub topic
//! (`diiisco/models/1.0.0`). Delivery is best-effort, at-most-once,
//! unordered across publishers.
//!
//! Zero-peer publishing is permitted: gossipsub reports
//! `InsufficientPeers` when the mesh is empty, and the swarm treats
//! that as success — a node subscribed alone must still be able to
//! emit (its own ingress receives the publication via loopback).

use libp2p::gossipsub;
use libp2p::identity;

use diiisco_types::{DiiiscoError, Result};

/// Heartbeat interval for the gossip mesh.
const HEARTBEAT_SECS: u64 = 10;

/// Builds a configured `gossipsub::Behaviour`.
///
/// Messages are signed with the node identity
/// (`MessageAuthenticity::Signed`); the transmit cap matches the
/// direct-protocol frame cap so an envelope deliverable on one
/// transport is deliverable on the other.
pub fn build_gossip_behaviour(
    keypair: &identity::Keypair,
    max_transmit_size: usize,
) -> Result<gossipsub::Behaviour> {
    let config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(std::time::Duration::from_secs(HEARTBEAT_SECS))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(max_transmit_size)
        .build()
        .map_err(|e| DiiiscoError::NetworkError {
            reason: format!("failed to build gossipsub config: {e}"),
        })?;

    gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(keypair.clone()),
        config,
    )
    .map_err(|e| DiiiscoError::NetworkError {
        reason: format!("failed to create gossipsub behaviour: {e}"),
    })
}

/// Creates the gossipsub topic handle for a topic string.
pub fn topic(name: &str) -> gossipsub::IdentTopic {
    gossipsub::IdentTopic::new(name)
}

/// Publishes a frame, tolerating an empty mesh.
pub fn publish(
    behaviour: &mut gossipsub::Behaviour,
    topic_name: &str,
    data: Vec<u8>,
) -> Result<()> {
    match behaviour.publish(topic(topic_name), data) {
        Ok(_) => Ok(()),
        // Nobody subscribed yet — allowed; loopback still delivers.
        Err(gossipsub::PublishError::InsufficientPeers) => {
            tracing::debug!(topic = topic_name, "published to empty mesh");
            Ok(())
        }
        Err(e) => Err(DiiiscoError::NetworkError {
            reason: format!("failed to publish to '{topic_name}': {e}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
