//! Main event loop driving all node subsystems.
//!
//! Spawned as one tokio task by [`crate::node::Node::start`]. A
//! `tokio::select!` multiplexes:
//!
//! 1. the libp2p swarm (one event per poll),
//! 2. network events emitted by the swarm,
//! 3. the outbox feeding the egress router,
//! 4. the emit-self loopback of broadcast envelopes,
//! 5. supervisor timer callbacks (backoff, bootstrap settle),
//! 6. commands from the façade,
//! 7. the 60 s supervisor tick,
//! 8. the shutdown watch channel.
//!
//! Message handlers are spawned, never awaited inline — the loop
//! stays responsive while inference or ledger calls run.

use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::{mpsc, watch};

use diiisco_ledger::Wallet;
use diiisco_model::ModelAccumulator;
use diiisco_network::{DiiiscoSwarm, NetworkEvent, Reachability};
use diiisco_protocol::Envelope;

use crate::auction::QuoteAuction;
use crate::command::{NodeCommand, NodeStatus, PeerSummary};
use crate::processor::{log_processing_error, MessageProcessor};
use crate::router::{MessageRouter, OutboundMessage};
use crate::sessions::SessionStore;
use crate::supervisor::{ReconnectSupervisor, SupervisorCommand};

/// Supervisor tick interval.
const TICK_SECS: u64 = 60;

/// Sessions idle longer than this are dropped on the tick.
const SESSION_TTL: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// NodeRuntime
// ---------------------------------------------------------------------------

/// Owned runtime state moved into the event-loop task.
pub(crate) struct NodeRuntime {
    pub swarm: DiiiscoSwarm,
    pub network_rx: mpsc::UnboundedReceiver<NetworkEvent>,
    pub processor: Arc<MessageProcessor>,
    pub router: MessageRouter,
    pub supervisor: ReconnectSupervisor,
    pub supervisor_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
    pub outbox_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    pub loopback_rx: mpsc::UnboundedReceiver<Envelope>,
    pub command_rx: mpsc::Receiver<NodeCommand>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub auction: QuoteAuction,
    pub sessions: SessionStore,
    pub accumulator: ModelAccumulator,
    pub wallet: Arc<Wallet>,
    pub own_peer_id: PeerId,
    pub bootstrap: Vec<libp2p::Multiaddr>,
    pub min_connections: usize,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub(crate) async fn run_event_loop(mut rt: NodeRuntime) {
    tracing::info!(peer_id = %rt.own_peer_id, "node event loop starting");

    if let Err(e) = rt.swarm.start_listening() {
        tracing::error!(%e, "failed to start listening, continuing without listener");
    }

    // Seed the mesh from the bootstrap list.
    if !rt.bootstrap.is_empty() {
        rt.supervisor.reconnect_to_bootstrap(&mut rt.swarm);
    }

    let mut tick = tokio::time::interval(Duration::from_secs(TICK_SECS));
    // First tick fires immediately; skip it so boot dials settle.
    tick.tick().await;

    loop {
        tokio::select! {
            // 1. Drive the swarm.
            _ = rt.swarm.poll_next() => {}

            // 2. Network events.
            Some(event) = rt.network_rx.recv() => {
                handle_network_event(&mut rt, event);
            }

            // 3. Outbound envelopes from processor and façade.
            Some(msg) = rt.outbox_rx.recv() => {
                if let Err(e) = rt.router.dispatch(&mut rt.swarm, msg) {
                    tracing::warn!(%e, "outbound dispatch failed");
                }
            }

            // 4. Emit-self loopback of broadcasts.
            Some(envelope) = rt.loopback_rx.recv() => {
                spawn_processing(&rt, envelope, rt.own_peer_id);
            }

            // 5. Supervisor timer callbacks.
            Some(cmd) = rt.supervisor_rx.recv() => {
                match cmd {
                    SupervisorCommand::AttemptReconnect(peer) => {
                        rt.supervisor.attempt_reconnect(&mut rt.swarm, peer);
                    }
                    SupervisorCommand::ReportBootstrap { dialed } => {
                        tracing::info!(
                            dialed,
                            connections = rt.swarm.connection_count(),
                            "bootstrap recovery settled"
                        );
                    }
                }
            }

            // 6. Façade commands.
            Some(cmd) = rt.command_rx.recv() => {
                if handle_command(&mut rt, cmd) {
                    tracing::info!("shutdown command received");
                    break;
                }
            }

            // 7. Supervisor tick.
            _ = tick.tick() => {
                rt.supervisor.tick(&mut rt.swarm);
                let pruned = rt.sessions.prune_older_than(SESSION_TTL);
                if pruned > 0 {
                    tracing::info!(pruned, "stale sessions dropped");
                }
            }

            // 8. Shutdown signal.
            _ = rt.shutdown_rx.changed() => {
                if *rt.shutdown_rx.borrow() {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }
    }

    shutdown_sequence(&mut rt);
    tracing::info!("node event loop exited");
}

// ---------------------------------------------------------------------------
// Network events
// ---------------------------------------------------------------------------

fn handle_network_event(rt: &mut NodeRuntime, event: NetworkEvent) {
    match event {
        NetworkEvent::EnvelopeReceived {
            envelope, source, ..
        } => {
            spawn_processing(rt, envelope, source);
        }

        NetworkEvent::PeerDiscovered { peer, addrs } => {
            rt.supervisor.on_discovery(peer, addrs.clone());
            // Below the floor, discovery doubles as dial queue.
            if rt.swarm.connection_count() < rt.min_connections
                && !rt.swarm.is_connected(&peer)
            {
                if let Err(e) = rt.swarm.dial_peer(peer, addrs) {
                    tracing::debug!(%peer, %e, "discovery dial rejected");
                }
            }
        }

        NetworkEvent::PeerConnected { peer, addr } => {
            rt.supervisor.on_connect(peer, addr);
        }

        NetworkEvent::PeerDisconnected { peer } => {
            rt.supervisor.on_disconnect(peer);
        }

        NetworkEvent::DialFailed { peer, kind, reason } => {
            tracing::debug!(?peer, %kind, reason, "dial failed");
            if let Some(peer) = peer {
                rt.supervisor.on_dial_failure(peer);
            }
        }

        NetworkEvent::DirectDelivered { request } => {
            rt.router.on_direct_delivered(request);
        }

        NetworkEvent::DirectFailed { request, reason } => {
            rt.router.on_direct_failed(&mut rt.swarm, request, &reason);
        }

        NetworkEvent::ReachabilityChanged(reachability) => {
            tracing::info!(%reachability, "reachability changed");
            if reachability == Reachability::Private {
                // Become dial-able through the public relays we know.
                for addr in rt.bootstrap.clone() {
                    if let Err(e) = rt.swarm.listen_on_relay(&addr) {
                        tracing::debug!(%addr, %e, "relay listen failed");
                    }
                }
            }
        }

        NetworkEvent::HolePunched { peer } => {
            tracing::info!(%peer, "relayed connection upgraded to direct");
        }

        NetworkEvent::PingResult { peer, latency_ms } => {
            tracing::trace!(%peer, ?latency_ms, "keep-alive result");
        }
    }
}

/// Spawns the processor on one inbound envelope.
///
/// Handlers for distinct session ids run in parallel; the processor
/// serializes same-id handlers internally.
fn spawn_processing(rt: &NodeRuntime, envelope: Envelope, source: PeerId) {
    let processor = Arc::clone(&rt.processor);
    tokio::spawn(async move {
        let role = envelope.role.clone();
        let id = envelope.id.clone();
        if let Err(e) = processor.process(envelope, source).await {
            log_processing_error(&role, &id, &e);
        }
    });
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Processes one command; returns `true` on shutdown.
fn handle_command(rt: &mut NodeRuntime, cmd: NodeCommand) -> bool {
    match cmd {
        NodeCommand::GetPeers { reply } => {
            let peers = rt
                .swarm
                .connections()
                .into_iter()
                .map(|info| PeerSummary {
                    peer_id: info.peer_id.to_string(),
                    remote_addr: info.addr.to_string(),
                    latency_ms: info.latency_ms,
                })
                .collect();
            let _ = reply.send(peers);
            false
        }

        NodeCommand::GetStatus { reply } => {
            let status = NodeStatus {
                peer_id: rt.own_peer_id.to_string(),
                wallet_addr: rt.wallet.address().as_str().into(),
                listeners: rt.swarm.listeners().iter().map(|a| a.to_string()).collect(),
                reachability: rt.swarm.reachability().to_string(),
                connections: rt.swarm.connection_count(),
                sessions: rt.sessions.count(),
                open_auctions: rt.auction.open_windows(),
                delivery: rt.router.counters(),
            };
            let _ = reply.send(status);
            false
        }

        NodeCommand::Shutdown => true,
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Ordered teardown: timers, topics, then the swarm (dropped by the
/// caller returning). The HTTP façade is stopped by the daemon before
/// the shutdown signal reaches this loop.
fn shutdown_sequence(rt: &mut NodeRuntime) {
    tracing::info!("running shutdown sequence");
    rt.supervisor.shutdown();
    rt.auction.shutdown();
    rt.accumulator.shutdown();
    rt.swarm.unsubscribe();
}
