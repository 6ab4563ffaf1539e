//! Reconnection supervisor.
//!
//! Watches the peer network and re-establishes lost peers:
//!
//! - per-peer exponential backoff (`5 s × 2^attempts`, 5 attempts,
//!   then a 5-minute cooldown before the counter resets),
//! - bootstrap recovery when the node is fully disconnected, rerun at
//!   most every 2 minutes while below the connection floor,
//! - peer records with set-union multiaddrs, evicted after 24 h of
//!   silence; only peers seen within the last hour are redialed.
//!
//! Backoff timers are plain spawned sleeps that post a command back
//! to the event loop; every timer handle is tracked so shutdown can
//! cancel them all.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use diiisco_network::DiiiscoSwarm;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Base reconnect delay.
pub const BASE_DELAY: Duration = Duration::from_secs(5);

/// Attempts before a peer enters cooldown.
pub const MAX_ATTEMPTS: u32 = 5;

/// Cooldown after the attempt budget is exhausted.
pub const COOLDOWN: Duration = Duration::from_secs(300);

/// Minimum spacing between bootstrap recovery runs while the node is
/// below the connection floor (but not at zero).
pub const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(120);

/// Peer records older than this are evicted.
pub const RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Only peers seen this recently are redialed from the tick.
pub const REDIAL_HORIZON: Duration = Duration::from_secs(60 * 60);

/// Settle time after a bootstrap run before reporting.
pub const MESH_SETTLE: Duration = Duration::from_secs(5);

/// Reconnect delay for a given attempt count: `BASE × 2^attempts`.
pub fn delay_for(attempts: u32) -> Duration {
    BASE_DELAY * 2u32.saturating_pow(attempts)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// What the supervisor remembers about a peer.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    /// Last discovery/connect contact.
    pub last_seen: Instant,
    /// Known endpoints, set-union merged in insertion order.
    pub multiaddrs: Vec<Multiaddr>,
}

#[derive(Clone, Copy, Debug)]
struct ReconnectState {
    attempts: u32,
    last_attempt: Instant,
}

/// Timer-driven callbacks posted back to the event loop.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// A backoff delay elapsed; try dialing the peer now.
    AttemptReconnect(PeerId),
    /// The post-bootstrap settle time elapsed; report mesh size.
    ReportBootstrap {
        /// How many bootstrap dials were initiated.
        dialed: usize,
    },
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Per-peer backoff, bootstrap recovery, and health monitor.
pub struct ReconnectSupervisor {
    records: HashMap<PeerId, PeerRecord>,
    reconnect: HashMap<PeerId, ReconnectState>,
    connected: HashSet<PeerId>,
    bootstrap: Vec<Multiaddr>,
    min_connections: usize,
    last_count: usize,
    last_bootstrap_run: Option<Instant>,
    timers: HashMap<PeerId, JoinHandle<()>>,
    settle_timers: Vec<JoinHandle<()>>,
    command_tx: mpsc::UnboundedSender<SupervisorCommand>,
}

impl ReconnectSupervisor {
    /// Creates a supervisor posting timer callbacks to `command_tx`.
    pub fn new(
        bootstrap: Vec<Multiaddr>,
        min_connections: usize,
        command_tx: mpsc::UnboundedSender<SupervisorCommand>,
    ) -> Self {
        Self {
            records: HashMap::new(),
            reconnect: HashMap::new(),
            connected: HashSet::new(),
            bootstrap,
            min_connections,
            last_count: 0,
            last_bootstrap_run: None,
            timers: HashMap::new(),
            settle_timers: Vec::new(),
            command_tx,
        }
    }

    /// Tracked peer records (for inspection).
    pub fn record(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.records.get(peer)
    }

    /// Current attempt count for a peer, if backing off.
    pub fn attempts(&self, peer: &PeerId) -> Option<u32> {
        self.reconnect.get(peer).map(|s| s.attempts)
    }

    // -----------------------------------------------------------------------
    // Event intake
    // -----------------------------------------------------------------------

    /// Records a discovered peer, merging addresses (set union).
    pub fn on_discovery(&mut self, peer: PeerId, addrs: Vec<Multiaddr>) {
        let record = self.records.entry(peer).or_insert_with(|| PeerRecord {
            last_seen: Instant::now(),
            multiaddrs: Vec::new(),
        });
        record.last_seen = Instant::now();
        for addr in addrs {
            if !record.multiaddrs.contains(&addr) {
                record.multiaddrs.push(addr);
            }
        }
    }

    /// Marks a peer connected and clears its backoff state.
    pub fn on_connect(&mut self, peer: PeerId, addr: Multiaddr) {
        self.connected.insert(peer);
        self.on_discovery(peer, vec![addr]);
        self.reconnect.remove(&peer);
        if let Some(timer) = self.timers.remove(&peer) {
            timer.abort();
        }
    }

    /// Marks a peer disconnected and schedules a reconnect.
    pub fn on_disconnect(&mut self, peer: PeerId) {
        self.connected.remove(&peer);
        if self.records.contains_key(&peer) {
            self.schedule_reconnect(peer);
        }
    }

    /// A dial for a tracked peer failed on every address.
    pub fn on_dial_failure(&mut self, peer: PeerId) {
        if self.records.contains_key(&peer) && !self.connected.contains(&peer) {
            self.schedule_reconnect(peer);
        }
    }

    // -----------------------------------------------------------------------
    // Reconnect scheduling
    // -----------------------------------------------------------------------

    /// Schedules `attempt_reconnect` after the backoff delay.
    ///
    /// Silently skips peers that exhausted their attempt budget until
    /// the cooldown expires, at which point the counter resets.
    pub fn schedule_reconnect(&mut self, peer: PeerId) {
        if self.timers.get(&peer).is_some_and(|t| !t.is_finished()) {
            return;
        }

        if let Some(state) = self.reconnect.get(&peer).copied() {
            if state.attempts >= MAX_ATTEMPTS {
                if state.last_attempt.elapsed() > COOLDOWN {
                    self.reconnect.remove(&peer);
                } else {
                    return;
                }
            }
        }

        let attempts = self.reconnect.get(&peer).map_or(0, |s| s.attempts);
        let delay = delay_for(attempts);
        tracing::debug!(%peer, attempts, ?delay, "reconnect scheduled");

        let tx = self.command_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SupervisorCommand::AttemptReconnect(peer));
        });
        self.timers.insert(peer, timer);

        self.reconnect.insert(
            peer,
            ReconnectState {
                attempts: attempts + 1,
                last_attempt: Instant::now(),
            },
        );
    }

    /// Dials a peer at its recorded addresses, in insertion order.
    ///
    /// Called when a backoff timer fires. Success is observed through
    /// the connect event; a dial error reschedules.
    pub fn attempt_reconnect(&mut self, swarm: &mut DiiiscoSwarm, peer: PeerId) {
        self.timers.remove(&peer);

        if self.connected.contains(&peer) || swarm.is_connected(&peer) {
            self.reconnect.remove(&peer);
            return;
        }

        let Some(record) = self.records.get(&peer) else {
            return;
        };
        let addrs = record.multiaddrs.clone();
        if addrs.is_empty() {
            return;
        }

        tracing::info!(%peer, addr_count = addrs.len(), "attempting reconnect");
        if let Err(e) = swarm.dial_peer(peer, addrs) {
            tracing::debug!(%peer, %e, "reconnect dial rejected");
            self.schedule_reconnect(peer);
        }
        // Failure after dialing lands in on_dial_failure via the
        // swarm's dial-error event.
    }

    // -----------------------------------------------------------------------
    // Bootstrap recovery
    // -----------------------------------------------------------------------

    /// Dials every bootstrap address sequentially; reports the mesh
    /// size after a settle delay.
    ///
    /// Returns the number of dials initiated without an immediate
    /// error (connections confirm asynchronously).
    pub fn reconnect_to_bootstrap(&mut self, swarm: &mut DiiiscoSwarm) -> usize {
        self.last_bootstrap_run = Some(Instant::now());
        let mut dialed = 0usize;

        for addr in self.bootstrap.clone() {
            match swarm.dial_addr(addr.clone()) {
                Ok(()) => dialed += 1,
                Err(e) => {
                    tracing::warn!(%addr, %e, "bootstrap dial failed");
                }
            }
        }

        tracing::info!(dialed, total = self.bootstrap.len(), "bootstrap recovery started");

        // Give the mesh a moment to settle before reporting.
        let tx = self.command_tx.clone();
        self.settle_timers.retain(|t| !t.is_finished());
        self.settle_timers.push(tokio::spawn(async move {
            tokio::time::sleep(MESH_SETTLE).await;
            let _ = tx.send(SupervisorCommand::ReportBootstrap { dialed });
        }));

        dialed
    }

    // -----------------------------------------------------------------------
    // Periodic tick
    // -----------------------------------------------------------------------

    /// Health monitor, invoked every 60 s by the event loop.
    pub fn tick(&mut self, swarm: &mut DiiiscoSwarm) {
        let count = swarm.connection_count();
        if count != self.last_count {
            tracing::info!(
                connections = count,
                previous = self.last_count,
                "connection count changed"
            );
            self.last_count = count;
        }

        if count == 0 && !self.bootstrap.is_empty() {
            self.reconnect_to_bootstrap(swarm);
        } else if count < self.min_connections
            && !self.bootstrap.is_empty()
            && self
                .last_bootstrap_run
                .map_or(true, |at| at.elapsed() > BOOTSTRAP_RETRY_INTERVAL)
        {
            self.reconnect_to_bootstrap(swarm);
        }

        // Redial recently-seen peers that dropped off.
        let candidates: Vec<PeerId> = self
            .records
            .iter()
            .filter(|(peer, record)| {
                !self.connected.contains(peer)
                    && record.last_seen.elapsed() < REDIAL_HORIZON
            })
            .map(|(peer, _)| *peer)
            .collect();
        for peer in candidates {
            // Per-peer cooldown is honored inside schedule_reconnect.
            self.schedule_reconnect(peer);
        }

        // Evict records that went silent for a day.
        let before = self.records.len();
        self.records
            .retain(|_, record| record.last_seen.elapsed() < RECORD_TTL);
        let evicted = before - self.records.len();
        if evicted > 0 {
            tracing::debug!(evicted, "stale peer records evicted");
        }
        self.reconnect
            .retain(|peer, _| self.records.contains_key(peer));
    }

    /// Aborts every pending timer (shutdown step 2).
    pub fn shutdown(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        for timer in self.settle_timers.drain(..) {
            timer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
