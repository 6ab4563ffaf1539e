//! High-level swarm wrapper for the diiisco network.
//!
//! [`DiiiscoSwarm`] encapsulates the libp2p `Swarm` with the combined
//! [`DiiiscoBehaviour`] and fans every relevant event out as a
//! [`NetworkEvent`] on an unbounded channel. The node event loop owns
//! the swarm exclusively; other components talk to it through
//! commands and events, never directly.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use futures::StreamExt;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{
    autonat, dcutr, gossipsub, identify, mdns, noise, ping, relay, request_response,
    yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
};
use tokio::sync::{mpsc, watch};

use diiisco_protocol::Envelope;
use diiisco_types::{DialErrorKind, DiiiscoError};

use crate::config::NetworkConfig;
use crate::direct::{build_direct_behaviour, DirectAck, DirectCodec};
use crate::events::{NetworkEvent, TransportKind};
use crate::gossip;
use crate::hole_punch;
use crate::nat::{self, ReachabilityTracker};
use crate::relay as relay_mod;
use crate::transport;

/// Convenience alias so the `#[derive(NetworkBehaviour)]` macro never
/// sees a shadowed `Result`.
type NResult<T> = std::result::Result<T, DiiiscoError>;

// ---------------------------------------------------------------------------
// Combined behaviour
// ---------------------------------------------------------------------------

/// Combined libp2p behaviour for diiisco.
///
/// The `#[derive(NetworkBehaviour)]` macro generates
/// `DiiiscoBehaviourEvent` with one variant per field.
#[derive(NetworkBehaviour)]
pub struct DiiiscoBehaviour {
    /// Pub/sub broadcast on the well-known topic.
    pub gossip: gossipsub::Behaviour,
    /// One-shot direct messaging.
    pub direct: request_response::Behaviour<DirectCodec>,
    /// Local-network auto-discovery.
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Peer metadata exchange on every connection.
    pub identify: identify::Behaviour,
    /// Application-level keep-alive with latency measurement.
    pub ping: ping::Behaviour,
    /// Reachability probing.
    pub autonat: autonat::Behaviour,
    /// Dial-out through relays.
    pub relay_client: relay::client::Behaviour,
    /// Relayed → direct upgrade.
    pub dcutr: Toggle<dcutr::Behaviour>,
    /// Serve circuits for NATed peers.
    pub relay_server: Toggle<relay::Behaviour>,
}

// ---------------------------------------------------------------------------
// Connection bookkeeping
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct ConnectionMeta {
    peer: PeerId,
    addr: Multiaddr,
    inbound: bool,
    established_at: Instant,
}

/// One live connection, as reported by `GET /peers`.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Remote peer id.
    pub peer_id: PeerId,
    /// Remote address.
    pub addr: Multiaddr,
    /// Last keep-alive round trip, when measured.
    pub latency_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// DiiiscoSwarm
// ---------------------------------------------------------------------------

/// High-level wrapper around `Swarm<DiiiscoBehaviour>`.
pub struct DiiiscoSwarm {
    swarm: Swarm<DiiiscoBehaviour>,
    config: NetworkConfig,
    topic: gossipsub::IdentTopic,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    mesh_tx: watch::Sender<usize>,
    subscribers: HashSet<PeerId>,
    reachability: ReachabilityTracker,
    connections: HashMap<ConnectionId, ConnectionMeta>,
    latencies: HashMap<PeerId, u64>,
}

impl DiiiscoSwarm {
    /// Creates the swarm and subscribes to the well-known topic.
    ///
    /// Returns `(swarm, events, mesh)` where `events` delivers every
    /// [`NetworkEvent`] and `mesh` tracks the number of peers
    /// subscribed to the well-known topic.
    pub fn new(
        config: NetworkConfig,
        keypair: libp2p::identity::Keypair,
    ) -> NResult<(
        Self,
        mpsc::UnboundedReceiver<NetworkEvent>,
        watch::Receiver<usize>,
    )> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (mesh_tx, mesh_rx) = watch::channel(0usize);

        let behaviour_config = config.clone();
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                transport::tcp_config(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| DiiiscoError::NetworkError {
                reason: format!("failed to configure TCP transport: {e}"),
            })?
            .with_dns()
            .map_err(|e| DiiiscoError::NetworkError {
                reason: format!("failed to configure DNS resolution: {e}"),
            })?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(|e| DiiiscoError::NetworkError {
                reason: format!("failed to configure relay client transport: {e}"),
            })?
            .with_behaviour(|key, relay_client| {
                build_behaviour(key, &behaviour_config, relay_client)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            })
            .map_err(|e| DiiiscoError::NetworkError {
                reason: format!("failed to build network behaviour: {e}"),
            })?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(Duration::from_secs(
                    config.idle_timeout_secs,
                ))
            })
            .build();

        let topic = gossip::topic(&config.topic);
        swarm
            .behaviour_mut()
            .gossip
            .subscribe(&topic)
            .map_err(|e| DiiiscoError::NetworkError {
                reason: format!("failed to subscribe to '{}': {e}", config.topic),
            })?;

        if let Some(addr) = config.advertise_addr.clone() {
            tracing::info!(%addr, "advertising configured external address");
            swarm.add_external_address(addr);
        }

        Ok((
            Self {
                swarm,
                config,
                topic,
                event_tx,
                mesh_tx,
                subscribers: HashSet::new(),
                reachability: ReachabilityTracker::new(),
                connections: HashMap::new(),
                latencies: HashMap::new(),
            },
            event_rx,
            mesh_rx,
        ))
    }

    /// This node's peer id.
    pub fn local_peer_id(&self) -> &PeerId {
        self.swarm.local_peer_id()
    }

    /// Addresses this node is listening on.
    pub fn listeners(&self) -> Vec<Multiaddr> {
        self.swarm.listeners().cloned().collect()
    }

    /// Current self-reported reachability.
    pub fn reachability(&self) -> nat::Reachability {
        self.reachability.current()
    }

    // -----------------------------------------------------------------------
    // Listening / dialing
    // -----------------------------------------------------------------------

    /// Starts listening on the configured address.
    pub fn start_listening(&mut self) -> NResult<()> {
        let addr = self.config.listen_addr.clone();
        self.swarm
            .listen_on(addr)
            .map(|_| ())
            .map_err(|e| DiiiscoError::NetworkError {
                reason: format!("failed to start listening: {e}"),
            })
    }

    /// Listens through a relay so NATed nodes become dial-able.
    ///
    /// Called with bootstrap addresses once reachability turns
    /// `Private`; no-op when the relay client is disabled.
    pub fn listen_on_relay(&mut self, relay_addr: &Multiaddr) -> NResult<()> {
        if !self.config.enable_relay_client {
            return Ok(());
        }
        let listen_addr = relay_mod::build_relay_listen_addr(relay_addr)?;
        self.swarm
            .listen_on(listen_addr)
            .map(|_| ())
            .map_err(|e| DiiiscoError::NetworkError {
                reason: format!("failed to listen on relay: {e}"),
            })
    }

    /// Dials a peer at its known addresses, tried in insertion order.
    pub fn dial_peer(&mut self, peer: PeerId, addrs: Vec<Multiaddr>) -> NResult<()> {
        let opts = DialOpts::peer_id(peer)
            .condition(PeerCondition::Disconnected)
            .addresses(addrs)
            .build();
        self.swarm.dial(opts).map_err(|e| DiiiscoError::DialFailed {
            kind: classify_dial_text(&e.to_string()),
            reason: e.to_string(),
        })
    }

    /// Dials a raw multiaddr (bootstrap entries).
    pub fn dial_addr(&mut self, addr: Multiaddr) -> NResult<()> {
        self.swarm
            .dial(addr)
            .map_err(|e| DiiiscoError::DialFailed {
                kind: classify_dial_text(&e.to_string()),
                reason: e.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Peers with at least one live connection.
    pub fn connected_peers(&self) -> HashSet<PeerId> {
        self.connections.values().map(|m| m.peer).collect()
    }

    /// Whether a peer is currently connected.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.swarm.is_connected(peer)
    }

    /// Snapshot of live connections for the status surface.
    pub fn connections(&self) -> Vec<PeerInfo> {
        self.connections
            .values()
            .map(|meta| PeerInfo {
                peer_id: meta.peer,
                addr: meta.addr.clone(),
                latency_ms: self.latencies.get(&meta.peer).copied(),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Publishes an encoded envelope on the well-known topic.
    ///
    /// Succeeds on an empty mesh (zero-peer publishing is allowed).
    pub fn publish(&mut self, data: Vec<u8>) -> NResult<()> {
        gossip::publish(
            &mut self.swarm.behaviour_mut().gossip,
            &self.config.topic,
            data,
        )
    }

    /// Sends an envelope on a fresh direct stream.
    ///
    /// The result arrives asynchronously as
    /// [`NetworkEvent::DirectDelivered`] or
    /// [`NetworkEvent::DirectFailed`] keyed by the returned id.
    pub fn send_direct(
        &mut self,
        peer: &PeerId,
        envelope: Envelope,
    ) -> request_response::OutboundRequestId {
        self.swarm
            .behaviour_mut()
            .direct
            .send_request(peer, envelope)
    }

    /// Unsubscribes from the well-known topic (shutdown step 3).
    pub fn unsubscribe(&mut self) {
        let _ = self.swarm.behaviour_mut().gossip.unsubscribe(&self.topic);
    }

    // -----------------------------------------------------------------------
    // Event loop integration
    // -----------------------------------------------------------------------

    /// Processes exactly one swarm event.
    ///
    /// Cancel-safe: dropping the future loses no events, they stay
    /// queued inside the swarm.
    pub async fn poll_next(&mut self) {
        let event = self.swarm.select_next_some().await;
        self.dispatch_swarm_event(event);
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.event_tx.send(event);
    }

    fn dispatch_swarm_event(&mut self, event: SwarmEvent<DiiiscoBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, "new listen address");
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                let addr = endpoint.get_remote_address().clone();
                tracing::info!(%peer_id, %addr, num_established, "connection established");
                self.connections.insert(
                    connection_id,
                    ConnectionMeta {
                        peer: peer_id,
                        addr: addr.clone(),
                        inbound: endpoint.is_listener(),
                        established_at: Instant::now(),
                    },
                );
                self.enforce_connection_limit(connection_id);
                self.emit(NetworkEvent::PeerConnected {
                    peer: peer_id,
                    addr,
                });
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                num_established,
                ..
            } => {
                tracing::info!(%peer_id, ?cause, num_established, "connection closed");
                self.connections.remove(&connection_id);
                if num_established == 0 {
                    self.latencies.remove(&peer_id);
                    self.emit(NetworkEvent::PeerDisconnected { peer: peer_id });
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                let kind = classify_dial_error(&error);
                tracing::warn!(?peer_id, %error, %kind, "outgoing connection error");
                self.emit(NetworkEvent::DialFailed {
                    peer: peer_id,
                    kind,
                    reason: error.to_string(),
                });
            }

            SwarmEvent::IncomingConnectionError {
                local_addr,
                send_back_addr,
                error,
                ..
            } => {
                tracing::warn!(%local_addr, %send_back_addr, %error, "incoming connection error");
            }

            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            other => {
                tracing::trace!(?other, "unhandled swarm event");
            }
        }
    }

    fn handle_behaviour_event(&mut self, event: DiiiscoBehaviourEvent) {
        match event {
            DiiiscoBehaviourEvent::Gossip(event) => self.handle_gossip_event(event),
            DiiiscoBehaviourEvent::Direct(event) => self.handle_direct_event(event),
            DiiiscoBehaviourEvent::Mdns(event) => self.handle_mdns_event(event),
            DiiiscoBehaviourEvent::Identify(event) => self.handle_identify_event(event),
            DiiiscoBehaviourEvent::Ping(event) => self.handle_ping_event(event),
            DiiiscoBehaviourEvent::Autonat(event) => {
                if let Some(reachability) = self.reachability.on_autonat_event(event) {
                    self.emit(NetworkEvent::ReachabilityChanged(reachability));
                }
            }
            DiiiscoBehaviourEvent::RelayClient(event) => {
                relay_mod::log_relay_client_event(&event);
            }
            DiiiscoBehaviourEvent::RelayServer(event) => {
                relay_mod::log_relay_server_event(&event);
            }
            DiiiscoBehaviourEvent::Dcutr(event) => {
                if let Some(peer) = hole_punch::handle_dcutr_event(event) {
                    self.emit(NetworkEvent::HolePunched { peer });
                }
            }
        }
    }

    fn handle_gossip_event(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            } => {
                if message.topic != self.topic.hash() {
                    tracing::trace!(topic = %message.topic, "gossip on foreign topic ignored");
                    return;
                }
                match Envelope::from_wire(&message.data) {
                    Ok(envelope) => self.emit(NetworkEvent::EnvelopeReceived {
                        envelope,
                        source: propagation_source,
                        transport: TransportKind::Broadcast,
                    }),
                    Err(e) => {
                        tracing::warn!(%propagation_source, %e, "undecodable gossip frame dropped");
                    }
                }
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                if topic == self.topic.hash() {
                    self.subscribers.insert(peer_id);
                    let _ = self.mesh_tx.send(self.subscribers.len());
                }
                tracing::debug!(%peer_id, %topic, "peer subscribed");
            }
            gossipsub::Event::Unsubscribed { peer_id, topic } => {
                if topic == self.topic.hash() {
                    self.subscribers.remove(&peer_id);
                    let _ = self.mesh_tx.send(self.subscribers.len());
                }
                tracing::debug!(%peer_id, %topic, "peer unsubscribed");
            }
            gossipsub::Event::GossipsubNotSupported { peer_id } => {
                tracing::trace!(%peer_id, "gossipsub not supported by peer");
            }
        }
    }

    fn handle_direct_event(&mut self, event: request_response::Event<Envelope, DirectAck>) {
        match event {
            // Inbound: one frame per stream; ack and hand to ingress.
            request_response::Event::Message {
                peer,
                message:
                    request_response::Message::Request {
                        request, channel, ..
                    },
            } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .direct
                    .send_response(channel, DirectAck)
                    .is_err()
                {
                    tracing::debug!(%peer, "direct ack channel closed");
                }
                self.emit(NetworkEvent::EnvelopeReceived {
                    envelope: request,
                    source: peer,
                    transport: TransportKind::Direct,
                });
            }

            request_response::Event::Message {
                message:
                    request_response::Message::Response { request_id, .. },
                ..
            } => {
                self.emit(NetworkEvent::DirectDelivered {
                    request: request_id,
                });
            }

            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
            } => {
                tracing::warn!(%peer, %error, "direct send failed");
                self.emit(NetworkEvent::DirectFailed {
                    request: request_id,
                    reason: error.to_string(),
                });
            }

            request_response::Event::InboundFailure { peer, error, .. } => {
                // Oversize frames and undecodable envelopes abort the
                // stream here; nothing reaches the ingress handler.
                tracing::warn!(%peer, %error, "inbound direct stream aborted");
            }

            request_response::Event::ResponseSent { peer, .. } => {
                tracing::trace!(%peer, "direct ack sent");
            }
        }
    }

    fn handle_mdns_event(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(list) => {
                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer, addr) in list {
                    by_peer.entry(peer).or_default().push(addr);
                }
                for (peer, addrs) in by_peer {
                    tracing::debug!(%peer, count = addrs.len(), "mDNS discovered peer");
                    self.emit(NetworkEvent::PeerDiscovered { peer, addrs });
                }
            }
            mdns::Event::Expired(list) => {
                tracing::trace!(count = list.len(), "mDNS records expired");
            }
        }
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        match event {
            identify::Event::Received { peer_id, info, .. } => {
                tracing::debug!(
                    %peer_id,
                    protocol_version = %info.protocol_version,
                    listen_addrs = ?info.listen_addrs,
                    "identify received"
                );
                self.emit(NetworkEvent::PeerDiscovered {
                    peer: peer_id,
                    addrs: info.listen_addrs,
                });
            }
            identify::Event::Sent { peer_id, .. } => {
                tracing::trace!(%peer_id, "identify sent");
            }
            identify::Event::Pushed { peer_id, .. } => {
                tracing::trace!(%peer_id, "identify pushed");
            }
            identify::Event::Error { peer_id, error, .. } => {
                tracing::debug!(%peer_id, %error, "identify error");
            }
        }
    }

    fn handle_ping_event(&mut self, event: ping::Event) {
        match event.result {
            Ok(rtt) => {
                let ms = rtt.as_millis().min(u128::from(u64::MAX)) as u64;
                self.latencies.insert(event.peer, ms);
                self.emit(NetworkEvent::PingResult {
                    peer: event.peer,
                    latency_ms: Some(ms),
                });
            }
            Err(failure) => {
                // Keep-alive failures are logged, never auto-close.
                tracing::warn!(peer = %event.peer, %failure, "keep-alive ping failed");
                self.latencies.remove(&event.peer);
                self.emit(NetworkEvent::PingResult {
                    peer: event.peer,
                    latency_ms: None,
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection manager
    // -----------------------------------------------------------------------

    /// Enforces `max_connections`, sparing the connection that just
    /// landed. Eviction prefers the oldest unused inbound connection
    /// once the inbound count crosses the threshold.
    fn enforce_connection_limit(&mut self, just_added: ConnectionId) {
        if self.connections.len() <= self.config.max_connections {
            return;
        }

        let inbound_count = self.connections.values().filter(|m| m.inbound).count();
        let prefer_inbound = inbound_count > self.config.inbound_connection_threshold;

        let victim = self
            .connections
            .iter()
            .filter(|(id, _)| **id != just_added)
            .filter(|(_, meta)| !prefer_inbound || meta.inbound)
            .filter(|(_, meta)| !self.latencies.contains_key(&meta.peer))
            .min_by_key(|(_, meta)| meta.established_at)
            .or_else(|| {
                self.connections
                    .iter()
                    .filter(|(id, _)| **id != just_added)
                    .min_by_key(|(_, meta)| meta.established_at)
            })
            .map(|(id, meta)| (*id, meta.peer));

        if let Some((connection_id, peer)) = victim {
            tracing::info!(
                %peer,
                total = self.connections.len(),
                max = self.config.max_connections,
                "evicting connection over limit"
            );
            self.swarm.close_connection(connection_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Behaviour construction
// ---------------------------------------------------------------------------

fn build_behaviour(
    key: &libp2p::identity::Keypair,
    config: &NetworkConfig,
    relay_client: relay::client::Behaviour,
) -> NResult<DiiiscoBehaviour> {
    let local_peer_id = key.public().to_peer_id();

    let gossip = gossip::build_gossip_behaviour(key, config.max_message_size)?;

    let direct_protocol = StreamProtocol::try_from_owned(config.direct_protocol.clone())
        .map_err(|e| DiiiscoError::ConfigError {
            reason: format!("invalid direct protocol '{}': {e}", config.direct_protocol),
        })?;
    let direct = build_direct_behaviour(
        direct_protocol,
        config.max_message_size,
        Duration::from_millis(config.direct_timeout_ms),
    );

    let mdns = if config.enable_mdns {
        let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
            .map_err(|e| DiiiscoError::NetworkError {
                reason: format!("failed to start mDNS: {e}"),
            })?;
        Some(behaviour)
    } else {
        None
    };

    let identify = identify::Behaviour::new(
        identify::Config::new("/diiisco/id/1.0.0".into(), key.public())
            .with_agent_version(format!("diiisco-node/{}", env!("CARGO_PKG_VERSION"))),
    );

    let ping = ping::Behaviour::new(
        ping::Config::new()
            .with_interval(Duration::from_secs(config.keep_alive_interval_secs))
            .with_timeout(Duration::from_secs(config.keep_alive_timeout_secs)),
    );

    let autonat = autonat::Behaviour::new(local_peer_id, nat::build_autonat_config());

    let dcutr = Toggle::from(config.enable_dcutr.then(|| dcutr::Behaviour::new(local_peer_id)));

    let relay_server = Toggle::from(relay_mod::build_relay_server_behaviour(
        local_peer_id,
        config,
    ));

    Ok(DiiiscoBehaviour {
        gossip,
        direct,
        mdns: Toggle::from(mdns),
        identify,
        ping,
        autonat,
        relay_client,
        dcutr,
        relay_server,
    })
}

// ---------------------------------------------------------------------------
// Dial error classification
// ---------------------------------------------------------------------------

/// Classifies a dial failure while preserving the original cause.
pub fn classify_dial_error(error: &DialError) -> DialErrorKind {
    classify_dial_text(&error.to_string())
}

fn classify_dial_text(text: &str) -> DialErrorKind {
    let lower = text.to_lowercase();
    if lower.contains("refused") || lower.contains("denied") {
        DialErrorKind::Refused
    } else if lower.contains("timed out") || lower.contains("timeout") {
        DialErrorKind::Timeout
    } else {
        DialErrorKind::Unreachable
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
