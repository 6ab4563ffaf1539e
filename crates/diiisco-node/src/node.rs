//! Node lifecycle and the cloneable handle.
//!
//! ```text
//! Initializing ──start()──▶ Running ──shutdown()──▶ ShuttingDown ──▶ (dropped)
//! ```
//!
//! [`Node::new`] wires every subsystem from the application config
//! and the injected collaborators; [`Node::start`] moves the runtime
//! into the event-loop task. Everything else talks to the node
//! through a [`NodeHandle`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use diiisco_ledger::{registry, LedgerClient, Wallet};
use diiisco_model::{ModelAccumulator, ModelClient};
use diiisco_network::{identity, DiiiscoSwarm, NetworkConfig};
use diiisco_protocol::signing::sign_envelope;
use diiisco_protocol::Envelope;
use diiisco_types::config::AppConfig;
use diiisco_types::{DiiiscoError, Result};

use crate::auction::QuoteAuction;
use crate::bus::EventBus;
use crate::command::{NodeCommand, NodeStatus, PeerSummary};
use crate::event_loop::{self, NodeRuntime};
use crate::pricing::QuotePipeline;
use crate::processor::MessageProcessor;
use crate::router::MessageRouter;
use crate::sessions::SessionStore;
use crate::supervisor::ReconnectSupervisor;

/// Bounded command channel capacity.
const COMMAND_CHANNEL_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Lifecycle state of the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Components created, event loop not started.
    Initializing,
    /// Event loop is active.
    Running,
    /// Graceful shutdown in progress.
    ShuttingDown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeHandle
// ---------------------------------------------------------------------------

/// Cloneable handle the façade uses to talk to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    outbox: mpsc::UnboundedSender<crate::router::OutboundMessage>,
    /// Keyed rendezvous for reply correlation.
    pub bus: EventBus,
    /// Mesh-wide model list accumulator.
    pub accumulator: ModelAccumulator,
    /// In-flight session store.
    pub sessions: SessionStore,
    wallet: Arc<Wallet>,
    mesh: watch::Receiver<usize>,
    own_peer_id: PeerId,
    auction_window: Duration,
}

impl NodeHandle {
    /// This node's peer id.
    pub fn own_peer_id(&self) -> PeerId {
        self.own_peer_id
    }

    /// This node's wallet address string.
    pub fn wallet_addr(&self) -> String {
        self.wallet.address().as_str().into()
    }

    /// The auction window (also the model-list debounce).
    pub fn auction_window(&self) -> Duration {
        self.auction_window
    }

    /// Signs an envelope with the node wallet.
    pub fn sign(&self, envelope: &mut Envelope) -> Result<()> {
        sign_envelope(envelope, self.wallet.signing_key())
    }

    /// Routes an outbound envelope through the egress router.
    pub fn send(&self, envelope: Envelope, target: Option<PeerId>) -> Result<()> {
        self.outbox
            .send(crate::router::OutboundMessage { envelope, target })
            .map_err(|_| DiiiscoError::NetworkError {
                reason: "node event loop is gone".into(),
            })
    }

    /// Blocks until the well-known topic has at least `min`
    /// subscribed peers, or fails with [`DiiiscoError::NoMesh`].
    pub async fn wait_for_mesh(&self, min: usize, timeout: Duration) -> Result<()> {
        let mut mesh = self.mesh.clone();
        tokio::time::timeout(timeout, mesh.wait_for(|count| *count >= min))
            .await
            .map_err(|_| DiiiscoError::NoMesh { needed: min })?
            .map_err(|_| DiiiscoError::NoMesh { needed: min })?;
        Ok(())
    }

    /// Enumerates live connections.
    pub async fn peers(&self) -> Result<Vec<PeerSummary>> {
        let (tx, rx) = oneshot::channel();
        self.command(NodeCommand::GetPeers { reply: tx }).await?;
        rx.await.map_err(|_| DiiiscoError::NetworkError {
            reason: "node event loop is gone".into(),
        })
    }

    /// Builds a status snapshot.
    pub async fn status(&self) -> Result<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.command(NodeCommand::GetStatus { reply: tx }).await?;
        rx.await.map_err(|_| DiiiscoError::NetworkError {
            reason: "node event loop is gone".into(),
        })
    }

    /// Submits the shutdown command.
    pub async fn request_shutdown(&self) {
        let _ = self.commands.send(NodeCommand::Shutdown).await;
    }

    async fn command(&self, cmd: NodeCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| DiiiscoError::NetworkError {
                reason: "node event loop is gone".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// The diiisco node — owns all subsystems and drives the event loop.
pub struct Node {
    state: NodeState,
    runtime: Option<NodeRuntime>,
    handle: NodeHandle,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Wires a node from the application config and collaborators.
    ///
    /// Resolves bootstrap aliases through the ledger registry, loads
    /// or creates the identity file, and builds the swarm. Nothing
    /// runs until [`start`](Self::start).
    pub async fn new(
        config: AppConfig,
        identity_path: &Path,
        ledger: Arc<dyn LedgerClient>,
        model: Arc<dyn ModelClient>,
    ) -> Result<Self> {
        config.validate()?;

        let wallet = Arc::new(Wallet::from_config(&config.algorand)?);
        tracing::info!(wallet = %wallet.address(), "wallet ready");

        // Provider mode only makes sense for an opted-in account;
        // opt in on its behalf when the ledger lets us.
        if config.models.enabled {
            match ledger
                .check_opted_in_to_asset(wallet.address(), config.algorand.asset_id)
                .await
            {
                Ok(status) if !status.opted_in => {
                    tracing::info!(
                        asset_id = config.algorand.asset_id,
                        "provider wallet not opted in to the protocol asset, opting in"
                    );
                    if let Err(e) = ledger
                        .opt_in_to_asset(wallet.address(), config.algorand.asset_id)
                        .await
                    {
                        tracing::warn!(%e, "opt-in failed; payments will fail until resolved");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(%e, "could not check provider opt-in"),
            }
        }

        // Resolve bootstrap aliases through the registry.
        let mut bootstrap: Vec<Multiaddr> = Vec::new();
        for entry in &config.libp2p_bootstrap_servers {
            let resolved = if registry::is_alias(entry) {
                ledger.resolve_alias(entry).await?
            } else {
                entry.clone()
            };
            let addr = resolved
                .parse::<Multiaddr>()
                .map_err(|e| DiiiscoError::ConfigError {
                    reason: format!("invalid bootstrap address '{resolved}': {e}"),
                })?;
            bootstrap.push(addr);
        }

        let keypair = identity::load_or_create(identity_path)?;
        let own_peer_id = keypair.public().to_peer_id();

        let net_config = NetworkConfig::from_app(&config, bootstrap.clone())?;
        let min_connections = net_config.min_connections;
        let (swarm, network_rx, mesh_rx) = DiiiscoSwarm::new(net_config, keypair)?;

        // Shared components.
        let bus = EventBus::new();
        let sessions = SessionStore::new();
        let auction_window = Duration::from_millis(config.quote_engine.wait_time);
        let accumulator = ModelAccumulator::new(auction_window);
        let auction = QuoteAuction::new(
            auction_window,
            config.quote_engine.quote_selection_function,
            Arc::clone(&ledger),
            config.algorand.asset_id,
            bus.clone(),
        );
        let pipeline = QuotePipeline::from_config(
            &config.quote_engine.quote_creation_function,
            Arc::clone(&model),
            config.models.charge_per_1m_tokens,
        )?;

        // Channels.
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor = Arc::new(MessageProcessor::new(
            own_peer_id.to_string(),
            Arc::clone(&wallet),
            Arc::clone(&ledger),
            model,
            config.models.enabled,
            accumulator.clone(),
            pipeline,
            auction.clone(),
            sessions.clone(),
            bus.clone(),
            outbox_tx.clone(),
            config.algorand.asset_id,
        ));

        let router = MessageRouter::new(
            config.direct_messaging.enabled,
            config.direct_messaging.fallback_to_gossipsub,
            loopback_tx,
        );
        let supervisor =
            ReconnectSupervisor::new(bootstrap.clone(), min_connections, supervisor_tx);

        let runtime = NodeRuntime {
            swarm,
            network_rx,
            processor,
            router,
            supervisor,
            supervisor_rx,
            outbox_rx,
            loopback_rx,
            command_rx,
            shutdown_rx,
            auction,
            sessions: sessions.clone(),
            accumulator: accumulator.clone(),
            wallet: Arc::clone(&wallet),
            own_peer_id,
            bootstrap,
            min_connections,
        };

        let handle = NodeHandle {
            commands: command_tx,
            outbox: outbox_tx,
            bus,
            accumulator,
            sessions,
            wallet,
            mesh: mesh_rx,
            own_peer_id,
            auction_window,
        };

        Ok(Self {
            state: NodeState::Initializing,
            runtime: Some(runtime),
            handle,
            shutdown_tx,
        })
    }

    /// Spawns the event loop; `Initializing → Running`.
    pub fn start(&mut self) -> Result<JoinHandle<()>> {
        if self.state != NodeState::Initializing {
            return Err(DiiiscoError::ConfigError {
                reason: format!("cannot start node in state '{}'", self.state),
            });
        }
        let runtime = self.runtime.take().ok_or_else(|| DiiiscoError::ConfigError {
            reason: "runtime already consumed".into(),
        })?;

        let handle = tokio::spawn(event_loop::run_event_loop(runtime));
        self.state = NodeState::Running;
        Ok(handle)
    }

    /// Signals graceful shutdown; await the start handle to join.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.state {
            NodeState::Initializing => Err(DiiiscoError::ConfigError {
                reason: "cannot shut down a node that was never started".into(),
            }),
            NodeState::ShuttingDown => Ok(()),
            NodeState::Running => {
                self.state = NodeState::ShuttingDown;
                let _ = self.shutdown_tx.send(true);
                Ok(())
            }
        }
    }

    /// A cloneable handle to this node.
    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
