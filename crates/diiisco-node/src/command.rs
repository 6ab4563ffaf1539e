//! Commands into the event loop and status snapshots out of it.
//!
//! Outbound envelopes take the dedicated outbox channel instead of a
//! command, so egress never queues behind status requests.

use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// NodeCommand
// ---------------------------------------------------------------------------

/// Commands submitted to the event loop by the façade.
#[derive(Debug)]
pub enum NodeCommand {
    /// Enumerate live connections.
    GetPeers {
        /// Receives the snapshot.
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },

    /// Build a status snapshot.
    GetStatus {
        /// Receives the snapshot.
        reply: oneshot::Sender<NodeStatus>,
    },

    /// Begin graceful shutdown.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// One live connection, as reported by `GET /peers`.
#[derive(Clone, Debug)]
pub struct PeerSummary {
    /// Remote peer id.
    pub peer_id: String,
    /// Remote multiaddr.
    pub remote_addr: String,
    /// Last keep-alive round trip, when measured.
    pub latency_ms: Option<u64>,
}

/// Egress delivery accounting kept by the router.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeliveryCounters {
    /// Direct sends acknowledged by the remote.
    pub direct_ok: u64,
    /// Direct sends that failed (before any fallback).
    pub direct_failed: u64,
    /// Envelopes published on the well-known topic.
    pub broadcast: u64,
}

/// Status snapshot of the running node.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    /// This node's peer id.
    pub peer_id: String,
    /// This node's wallet address.
    pub wallet_addr: String,
    /// Listen addresses.
    pub listeners: Vec<String>,
    /// Self-reported reachability.
    pub reachability: String,
    /// Live connection count.
    pub connections: usize,
    /// In-flight session count.
    pub sessions: usize,
    /// Open auction windows.
    pub open_auctions: usize,
    /// Egress delivery counters.
    pub delivery: DeliveryCounters,
}
