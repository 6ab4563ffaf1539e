//! diiisco wire protocol.
//!
//! Defines the message envelope shared by broadcast and direct
//! transports, the canonical JSON encoding that signatures are
//! computed over, quote/pricing types, and the per-role session
//! state machines.
//!
//! # Modules
//!
//! - [`envelope`] — roles, delivery taxonomy, wire codec
//! - [`canonical`] — deterministic JSON encoding for signing
//! - [`signing`] — Ed25519 envelope signing and verification
//! - [`quote`] — quote, bid, and pricing types
//! - [`session`] — customer/provider state machines

pub mod canonical;
pub mod envelope;
pub mod quote;
pub mod session;
pub mod signing;

pub use envelope::{DeliveryClass, Envelope, Role};
pub use quote::{Quote, QuoteBid, RawQuote};
pub use session::{CustomerState, ProviderState};
