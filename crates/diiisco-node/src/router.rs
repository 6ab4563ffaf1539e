//! Egress message router.
//!
//! One decision per outbound envelope:
//!
//! 1. Direct-preferred role + direct messaging enabled + target peer
//!    known → send on the direct protocol; the in-flight envelope is
//!    remembered so a failure can fall back.
//! 2. Everything else → publish on the well-known topic.
//!
//! On a direct failure the envelope is republished as broadcast once,
//! iff `fallbackToGossipsub` is enabled; otherwise the delivery fails.
//! No retries, no reordering, no per-peer queues — reply correlation
//! is the session workflow's job, keyed by session id.
//!
//! Every broadcast is also looped back into local ingress (emit-self),
//! so a node subscribed alone still hears its own publications.

use std::collections::HashMap;

use libp2p::request_response::OutboundRequestId;
use libp2p::PeerId;
use tokio::sync::mpsc;

use diiisco_network::DiiiscoSwarm;
use diiisco_protocol::{DeliveryClass, Envelope};
use diiisco_types::{DiiiscoError, Result};

use crate::command::DeliveryCounters;

/// One outbound message handed to the router.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Signed envelope to deliver.
    pub envelope: Envelope,
    /// Target peer for direct-preferred roles.
    pub target: Option<PeerId>,
}

/// How a message left the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// Sent on a direct stream, pending acknowledgement.
    Direct(OutboundRequestId),
    /// Published on the well-known topic.
    Broadcast,
}

/// Egress router; owned by the event loop next to the swarm.
pub struct MessageRouter {
    direct_enabled: bool,
    fallback_to_gossipsub: bool,
    pending: HashMap<OutboundRequestId, Envelope>,
    counters: DeliveryCounters,
    loopback: mpsc::UnboundedSender<Envelope>,
}

impl MessageRouter {
    /// Creates a router.
    ///
    /// `loopback` receives a copy of every broadcast envelope for
    /// local ingress (emit-self).
    pub fn new(
        direct_enabled: bool,
        fallback_to_gossipsub: bool,
        loopback: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            direct_enabled,
            fallback_to_gossipsub,
            pending: HashMap::new(),
            counters: DeliveryCounters::default(),
            loopback,
        }
    }

    /// Routes one outbound message.
    pub fn dispatch(
        &mut self,
        swarm: &mut DiiiscoSwarm,
        msg: OutboundMessage,
    ) -> Result<Dispatch> {
        let direct_eligible = msg.envelope.role.delivery_class()
            == DeliveryClass::DirectPreferred
            && self.direct_enabled;

        match (direct_eligible, msg.target) {
            (true, Some(target)) => {
                let request = swarm.send_direct(&target, msg.envelope.clone());
                tracing::debug!(
                    role = %msg.envelope.role,
                    id = %msg.envelope.id,
                    %target,
                    ?request,
                    "sent on direct protocol"
                );
                self.pending.insert(request, msg.envelope);
                Ok(Dispatch::Direct(request))
            }
            _ => {
                self.broadcast(swarm, msg.envelope)?;
                Ok(Dispatch::Broadcast)
            }
        }
    }

    /// Marks a direct send as acknowledged.
    pub fn on_direct_delivered(&mut self, request: OutboundRequestId) {
        if self.pending.remove(&request).is_some() {
            self.counters.direct_ok += 1;
        }
    }

    /// Handles a direct failure: broadcast once when fallback is on.
    pub fn on_direct_failed(
        &mut self,
        swarm: &mut DiiiscoSwarm,
        request: OutboundRequestId,
        reason: &str,
    ) {
        let Some(envelope) = self.pending.remove(&request) else {
            return;
        };
        self.counters.direct_failed += 1;

        if self.fallback_to_gossipsub {
            tracing::info!(
                role = %envelope.role,
                id = %envelope.id,
                reason,
                "direct delivery failed, falling back to broadcast"
            );
            if let Err(e) = self.broadcast(swarm, envelope) {
                tracing::warn!(%e, "broadcast fallback failed");
            }
        } else {
            let err = DiiiscoError::DeliveryFailed {
                reason: format!("direct send failed with fallback disabled: {reason}"),
            };
            tracing::warn!(role = %envelope.role, id = %envelope.id, %err, "delivery failed");
        }
    }

    fn broadcast(&mut self, swarm: &mut DiiiscoSwarm, envelope: Envelope) -> Result<()> {
        let bytes = envelope.to_wire()?;
        swarm.publish(bytes)?;
        self.counters.broadcast += 1;
        tracing::debug!(role = %envelope.role, id = %envelope.id, "published on well-known topic");

        // Emit-self: the local processor hears our own publications.
        let _ = self.loopback.send(envelope);
        Ok(())
    }

    /// Current delivery counters.
    pub fn counters(&self) -> DeliveryCounters {
        self.counters
    }
}
