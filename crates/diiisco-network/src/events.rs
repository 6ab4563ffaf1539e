//! Events emitted by the diiisco swarm.
//!
//! [`NetworkEvent`] is the unified event type higher layers consume.
//! Both transports converge here: a decoded envelope looks the same
//! whether it arrived by broadcast or on a direct stream, apart from
//! the [`TransportKind`] tag used for delivery accounting.

use libp2p::request_response::OutboundRequestId;
use libp2p::{Multiaddr, PeerId};

use diiisco_protocol::Envelope;
use diiisco_types::DialErrorKind;

use crate::nat::Reachability;

/// Which transport carried an inbound envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    /// Published on the well-known topic.
    Broadcast,
    /// One-shot stream on the direct protocol.
    Direct,
}

/// Events emitted by the network layer.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A decoded envelope arrived from a remote peer.
    ///
    /// Decoding succeeded; signature verification has NOT happened
    /// yet — that is the message processor's first job.
    EnvelopeReceived {
        /// The decoded envelope.
        envelope: Envelope,
        /// Peer the frame arrived from.
        source: PeerId,
        /// Transport that carried it.
        transport: TransportKind,
    },

    /// A peer was discovered (mDNS or identify).
    PeerDiscovered {
        /// Discovered peer.
        peer: PeerId,
        /// Addresses it was discovered at.
        addrs: Vec<Multiaddr>,
    },

    /// A connection to a peer was established.
    PeerConnected {
        /// Remote peer.
        peer: PeerId,
        /// Remote address of the connection.
        addr: Multiaddr,
    },

    /// The last connection to a peer closed.
    PeerDisconnected {
        /// Remote peer.
        peer: PeerId,
    },

    /// An outbound dial failed.
    DialFailed {
        /// Target peer, when known.
        peer: Option<PeerId>,
        /// Failure classification.
        kind: DialErrorKind,
        /// Original cause, preserved for logging.
        reason: String,
    },

    /// A direct send was acknowledged by the remote.
    DirectDelivered {
        /// Request id returned by `send_direct`.
        request: OutboundRequestId,
    },

    /// A direct send failed (dial failure, timeout, unsupported
    /// protocol, oversize frame...).
    DirectFailed {
        /// Request id returned by `send_direct`.
        request: OutboundRequestId,
        /// Failure detail.
        reason: String,
    },

    /// Self-reported reachability changed.
    ReachabilityChanged(Reachability),

    /// A relayed connection was upgraded to a direct one.
    HolePunched {
        /// Upgraded peer.
        peer: PeerId,
    },

    /// A keep-alive ping completed.
    PingResult {
        /// Pinged peer.
        peer: PeerId,
        /// Round-trip latency; `None` when the ping failed.
        latency_ms: Option<u64>,
    },
}
