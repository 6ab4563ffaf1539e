//! Ledger collaborator for the diiisco marketplace.
//!
//! The chain itself is an external collaborator — the core only issues
//! a fixed set of calls against it. This crate defines that consumed
//! interface ([`LedgerClient`]), the local [`Wallet`](wallet::Wallet)
//! that signs envelopes, bootstrap alias resolution, and an in-memory
//! ledger with the full escrow semantics used by tests and local
//! development. SDK-backed clients implement the same trait in
//! deployments that talk to a real network.

pub mod memory;
pub mod registry;
pub mod wallet;

use async_trait::async_trait;

use diiisco_types::{Result, SessionId, WalletAddr};

pub use memory::InMemoryLedger;
pub use wallet::Wallet;

// ---------------------------------------------------------------------------
// Call results
// ---------------------------------------------------------------------------

/// Lifecycle state of an on-chain escrow slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuoteStatus {
    /// Slot created, not yet funded.
    Created,
    /// Customer transferred escrow.
    Funded,
    /// Payment settled to the provider.
    Completed,
    /// Escrow returned to the customer.
    Refunded,
}

impl std::fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Funded => "funded",
            Self::Completed => "completed",
            Self::Refunded => "refunded",
        };
        write!(f, "{s}")
    }
}

/// Result of `verify_quote_funded`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FundingStatus {
    /// Whether the slot has received any escrow.
    pub funded: bool,
    /// Current slot lifecycle state.
    pub status: QuoteStatus,
    /// Escrowed amount in USDC base units.
    pub usdc_base_units: u64,
}

/// Result of `check_opted_in_to_asset`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OptInStatus {
    /// Whether the account holds the protocol asset.
    pub opted_in: bool,
    /// Asset balance in base units.
    pub balance: u64,
}

/// Confirmation of a settled transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Confirmation {
    /// Transaction id assigned by the ledger.
    pub tx_id: String,
    /// Round the transaction was confirmed in.
    pub confirmed_round: u64,
}

// ---------------------------------------------------------------------------
// LedgerClient
// ---------------------------------------------------------------------------

/// The atomic calls the core issues against the ledger.
///
/// Implementations must be thread-safe; the underlying client owns its
/// own transaction composition. All methods may perform network I/O.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Creates an on-chain escrow slot for a session.
    async fn create_quote(
        &self,
        quote_id: &SessionId,
        customer_addr: &WalletAddr,
        usdc_base_units: u64,
    ) -> Result<()>;

    /// Transfers escrow from the customer into the slot.
    async fn fund_quote(&self, quote_id: &SessionId, usdc_base_units: u64) -> Result<()>;

    /// Reads the funding state of a slot.
    async fn verify_quote_funded(&self, quote_id: &SessionId) -> Result<FundingStatus>;

    /// Settles payment to the provider.
    async fn complete_quote(
        &self,
        quote_id: &SessionId,
        provider: &WalletAddr,
    ) -> Result<Confirmation>;

    /// Aborts the slot and refunds the customer.
    ///
    /// Exposed but never driven automatically — the contract owns its
    /// own refund path.
    async fn refund_quote(&self, quote_id: &SessionId) -> Result<()>;

    /// Checks whether an account holds the protocol asset.
    async fn check_opted_in_to_asset(
        &self,
        addr: &WalletAddr,
        asset_id: u64,
    ) -> Result<OptInStatus>;

    /// Opts the account in to the protocol asset.
    async fn opt_in_to_asset(&self, addr: &WalletAddr, asset_id: u64) -> Result<()>;

    /// Resolves a bootstrap registry alias to a full multiaddr string.
    ///
    /// Only addresses of the shape `/(dns4|ip4)/host/tcp/port/p2p/id`
    /// are returned; anything else is an error.
    async fn resolve_alias(&self, name: &str) -> Result<String>;
}
