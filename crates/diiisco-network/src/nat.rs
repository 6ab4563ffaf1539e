//! Self-reported reachability via AutoNAT probes.
//!
//! An autonomous probe classifies this node as `Public`, `Private`,
//! or `Unknown`. A `Public` node serves relay circuits for others
//! (bounded by the relay caps); a `Private` node makes itself
//! dial-able by listening through publicly-reachable relays.

use libp2p::autonat;
use libp2p::Multiaddr;

// ---------------------------------------------------------------------------
// Reachability
// ---------------------------------------------------------------------------

/// Self-reported reachability of the local node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reachability {
    /// Publicly dial-able at a confirmed external address.
    Public,
    /// Behind a NAT or firewall; reachable only via relay.
    Private,
    /// Not yet determined.
    Unknown,
}

impl std::fmt::Display for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Private => write!(f, "private"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Maps a libp2p AutoNAT status to [`Reachability`].
pub fn from_autonat_status(status: &autonat::NatStatus) -> Reachability {
    match status {
        autonat::NatStatus::Public(_) => Reachability::Public,
        autonat::NatStatus::Private => Reachability::Private,
        autonat::NatStatus::Unknown => Reachability::Unknown,
    }
}

// ---------------------------------------------------------------------------
// ReachabilityTracker
// ---------------------------------------------------------------------------

/// Tracks the current reachability and confirmed external address.
pub struct ReachabilityTracker {
    current: Reachability,
    external_addr: Option<Multiaddr>,
}

impl ReachabilityTracker {
    /// Starts in `Unknown`.
    pub fn new() -> Self {
        Self {
            current: Reachability::Unknown,
            external_addr: None,
        }
    }

    /// Current reachability.
    pub fn current(&self) -> Reachability {
        self.current
    }

    /// Confirmed external address, only set when `Public`.
    pub fn external_address(&self) -> Option<&Multiaddr> {
        self.external_addr.as_ref()
    }

    /// Processes an AutoNAT event; returns the new reachability when
    /// it changed.
    pub fn on_autonat_event(&mut self, event: autonat::Event) -> Option<Reachability> {
        match event {
            autonat::Event::StatusChanged { new, .. } => {
                self.external_addr = match &new {
                    autonat::NatStatus::Public(addr) => Some(addr.clone()),
                    _ => None,
                };

                let mapped = from_autonat_status(&new);
                if mapped == self.current {
                    return None;
                }
                self.current = mapped;
                tracing::info!(
                    reachability = %self.current,
                    external_addr = ?self.external_addr,
                    "reachability changed"
                );
                Some(self.current)
            }
            autonat::Event::InboundProbe(probe) => {
                tracing::debug!(?probe, "autonat inbound probe");
                None
            }
            autonat::Event::OutboundProbe(probe) => {
                tracing::debug!(?probe, "autonat outbound probe");
                None
            }
        }
    }
}

impl Default for ReachabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the AutoNAT behaviour config.
pub fn build_autonat_config() -> autonat::Config {
    let mut config = autonat::Config::default();
    config.confidence_max = 3;
    config
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
