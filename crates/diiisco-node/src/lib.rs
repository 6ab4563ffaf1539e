//! diiisco node core.
//!
//! Owns everything between the network layer and the HTTP façade:
//! the unified message processor, the egress router with its fallback
//! ladder, the quote auction, the session workflow, and the
//! reconnection supervisor. A single event-loop task owns the swarm;
//! every other component communicates through channels and the keyed
//! rendezvous bus.
//!
//! # Modules
//!
//! - [`node`] — lifecycle ([`Node`]) and the cloneable [`NodeHandle`]
//! - [`event_loop`] — the `tokio::select!` loop driving all subsystems
//! - [`processor`] — signature-verified ingress dispatch (all roles)
//! - [`router`] — direct-vs-broadcast egress with fallback
//! - [`auction`] — per-session bid windows and selection policies
//! - [`sessions`] — customer/provider session store
//! - [`supervisor`] — per-peer backoff and bootstrap recovery
//! - [`pricing`] — the ordered quote-creation pipeline
//! - [`bus`] — keyed one-shot rendezvous for request correlation

pub mod auction;
pub mod bus;
pub mod command;
mod event_loop;
pub mod node;
pub mod pricing;
pub mod processor;
pub mod router;
pub mod sessions;
pub mod supervisor;

pub use bus::{BusEvent, EventBus};
pub use command::{DeliveryCounters, NodeCommand, NodeStatus, PeerSummary};
pub use node::{Node, NodeHandle, NodeState};
