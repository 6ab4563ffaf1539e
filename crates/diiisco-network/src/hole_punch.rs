//! DCUtR hole-punch upgrade handling.
//!
//! When both endpoints of a relayed connection support it, DCUtR
//! opportunistically replaces the circuit with a direct connection
//! once each side has learned the other's addresses.

use libp2p::dcutr;
use libp2p::PeerId;

/// Processes a DCUtR event; returns the peer on a successful upgrade.
pub fn handle_dcutr_event(event: dcutr::Event) -> Option<PeerId> {
    match event.result {
        Ok(_) => {
            tracing::info!(
                peer_id = %event.remote_peer_id,
                "hole punch succeeded, relayed connection upgraded to direct"
            );
            Some(event.remote_peer_id)
        }
        Err(error) => {
            tracing::debug!(
                peer_id = %event.remote_peer_id,
                %error,
                "hole punch failed, staying on relay"
            );
            None
        }
    }
}
