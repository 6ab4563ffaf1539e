//! In-memory ledger with the full escrow lifecycle.
//!
//! Used by tests and single-machine development. Slot semantics match
//! the on-chain contract the core drives: create → fund → complete,
//! with refund as the abort path. Accounts are permissive by default
//! (every address counts as opted in) so a fresh mesh can trade
//! without ceremony; strict mode requires explicit registration.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use diiisco_types::{DiiiscoError, Result, SessionId, WalletAddr};

use crate::registry;
use crate::{Confirmation, FundingStatus, LedgerClient, OptInStatus, QuoteStatus};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct EscrowSlot {
    customer: WalletAddr,
    required: u64,
    funded: u64,
    status: QuoteStatus,
}

#[derive(Clone, Copy, Debug, Default)]
struct Account {
    opted_in: bool,
    balance: u64,
}

/// In-memory [`LedgerClient`] implementation.
pub struct InMemoryLedger {
    slots: Mutex<HashMap<String, EscrowSlot>>,
    accounts: Mutex<HashMap<String, Account>>,
    aliases: Mutex<HashMap<String, String>>,
    strict_opt_in: bool,
    next_round: Mutex<u64>,
}

impl InMemoryLedger {
    /// Creates a permissive ledger (all accounts count as opted in).
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            accounts: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
            strict_opt_in: false,
            next_round: Mutex::new(1),
        }
    }

    /// Creates a ledger that only admits explicitly registered accounts.
    pub fn strict() -> Self {
        Self {
            strict_opt_in: true,
            ..Self::new()
        }
    }

    /// Registers an account with a protocol-asset balance.
    pub fn register_account(&self, addr: &WalletAddr, balance: u64) {
        let mut accounts = lock(&self.accounts);
        accounts.insert(
            addr.as_str().to_string(),
            Account {
                opted_in: true,
                balance,
            },
        );
    }

    /// Registers a bootstrap alias.
    pub fn add_alias(&self, name: impl Into<String>, multiaddr: impl Into<String>) {
        lock(&self.aliases).insert(name.into(), multiaddr.into());
    }

    /// Current status of a slot, for assertions.
    pub fn slot_status(&self, quote_id: &SessionId) -> Option<QuoteStatus> {
        lock(&self.slots).get(quote_id.as_str()).map(|s| s.status)
    }

    fn bump_round(&self) -> u64 {
        let mut round = lock(&self.next_round);
        *round += 1;
        *round
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks a mutex, recovering from poisoning.
///
/// Test-oriented state: a panicked writer leaves no partial update
/// worth preserving, so the poisoned guard is taken as-is.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// LedgerClient impl
// ---------------------------------------------------------------------------

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn create_quote(
        &self,
        quote_id: &SessionId,
        customer_addr: &WalletAddr,
        usdc_base_units: u64,
    ) -> Result<()> {
        let mut slots = lock(&self.slots);
        if slots.contains_key(quote_id.as_str()) {
            return Err(DiiiscoError::LedgerFailed {
                reason: format!("escrow slot already exists for {quote_id}"),
            });
        }
        slots.insert(
            quote_id.as_str().to_string(),
            EscrowSlot {
                customer: customer_addr.clone(),
                required: usdc_base_units,
                funded: 0,
                status: QuoteStatus::Created,
            },
        );
        tracing::debug!(%quote_id, usdc_base_units, "escrow slot created");
        Ok(())
    }

    async fn fund_quote(&self, quote_id: &SessionId, usdc_base_units: u64) -> Result<()> {
        let mut slots = lock(&self.slots);
        let slot = slots
            .get_mut(quote_id.as_str())
            .ok_or_else(|| DiiiscoError::LedgerFailed {
                reason: format!("no escrow slot for {quote_id}"),
            })?;
        if slot.status != QuoteStatus::Created {
            return Err(DiiiscoError::LedgerFailed {
                reason: format!("cannot fund slot in state {}", slot.status),
            });
        }
        slot.funded += usdc_base_units;
        slot.status = QuoteStatus::Funded;
        tracing::debug!(%quote_id, usdc_base_units, "escrow slot funded");
        Ok(())
    }

    async fn verify_quote_funded(&self, quote_id: &SessionId) -> Result<FundingStatus> {
        let slots = lock(&self.slots);
        let slot = slots
            .get(quote_id.as_str())
            .ok_or_else(|| DiiiscoError::LedgerFailed {
                reason: format!("no escrow slot for {quote_id}"),
            })?;
        Ok(FundingStatus {
            funded: slot.funded > 0,
            status: slot.status,
            usdc_base_units: slot.funded,
        })
    }

    async fn complete_quote(
        &self,
        quote_id: &SessionId,
        provider: &WalletAddr,
    ) -> Result<Confirmation> {
        let mut slots = lock(&self.slots);
        let slot = slots
            .get_mut(quote_id.as_str())
            .ok_or_else(|| DiiiscoError::LedgerFailed {
                reason: format!("no escrow slot for {quote_id}"),
            })?;
        if slot.status != QuoteStatus::Funded {
            return Err(DiiiscoError::LedgerFailed {
                reason: format!("cannot complete slot in state {}", slot.status),
            });
        }
        slot.status = QuoteStatus::Completed;

        // Credit the provider's account balance.
        let mut accounts = lock(&self.accounts);
        let account = accounts
            .entry(provider.as_str().to_string())
            .or_insert(Account {
                opted_in: true,
                balance: 0,
            });
        account.balance += slot.funded;

        let round = self.bump_round();
        tracing::debug!(%quote_id, %provider, round, "escrow settled");
        Ok(Confirmation {
            tx_id: format!("local-{quote_id}-{round}"),
            confirmed_round: round,
        })
    }

    async fn refund_quote(&self, quote_id: &SessionId) -> Result<()> {
        let mut slots = lock(&self.slots);
        let slot = slots
            .get_mut(quote_id.as_str())
            .ok_or_else(|| DiiiscoError::LedgerFailed {
                reason: format!("no escrow slot for {quote_id}"),
            })?;
        if slot.status == QuoteStatus::Completed {
            return Err(DiiiscoError::LedgerFailed {
                reason: "cannot refund a completed slot".into(),
            });
        }
        slot.status = QuoteStatus::Refunded;
        tracing::debug!(%quote_id, customer = %slot.customer, "escrow refunded");
        Ok(())
    }

    async fn check_opted_in_to_asset(
        &self,
        addr: &WalletAddr,
        _asset_id: u64,
    ) -> Result<OptInStatus> {
        let accounts = lock(&self.accounts);
        match accounts.get(addr.as_str()) {
            Some(account) => Ok(OptInStatus {
                opted_in: account.opted_in,
                balance: account.balance,
            }),
            None if self.strict_opt_in => Ok(OptInStatus {
                opted_in: false,
                balance: 0,
            }),
            None => Ok(OptInStatus {
                opted_in: true,
                balance: 0,
            }),
        }
    }

    async fn opt_in_to_asset(&self, addr: &WalletAddr, _asset_id: u64) -> Result<()> {
        let mut accounts = lock(&self.accounts);
        accounts
            .entry(addr.as_str().to_string())
            .or_default()
            .opted_in = true;
        Ok(())
    }

    async fn resolve_alias(&self, name: &str) -> Result<String> {
        let resolved = {
            let aliases = lock(&self.aliases);
            aliases.get(name).cloned()
        }
        .ok_or_else(|| DiiiscoError::LedgerFailed {
            reason: format!("unknown bootstrap alias: {name}"),
        })?;

        registry::validate_bootstrap_addr(&resolved)?;
        Ok(resolved)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> WalletAddr {
        WalletAddr::from_public_key(&[byte; 32])
    }

    fn session(id: &str) -> SessionId {
        SessionId::new(id).unwrap()
    }

    #[tokio::test]
    async fn full_escrow_lifecycle() {
        let ledger = InMemoryLedger::new();
        let id = session("s1");
        let customer = addr(1);
        let provider = addr(2);

        ledger.create_quote(&id, &customer, 17_000).await.unwrap();
        assert_eq!(ledger.slot_status(&id), Some(QuoteStatus::Created));

        ledger.fund_quote(&id, 17_000).await.unwrap();
        let status = ledger.verify_quote_funded(&id).await.unwrap();
        assert!(status.funded);
        assert_eq!(status.usdc_base_units, 17_000);
        assert_eq!(status.status, QuoteStatus::Funded);

        let confirmation = ledger.complete_quote(&id, &provider).await.unwrap();
        assert!(confirmation.confirmed_round > 0);
        assert_eq!(ledger.slot_status(&id), Some(QuoteStatus::Completed));

        // Provider received the escrow.
        let balance = ledger
            .check_opted_in_to_asset(&provider, 0)
            .await
            .unwrap()
            .balance;
        assert_eq!(balance, 17_000);
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let ledger = InMemoryLedger::new();
        let id = session("s1");
        ledger.create_quote(&id, &addr(1), 100).await.unwrap();
        assert!(ledger.create_quote(&id, &addr(1), 100).await.is_err());
    }

    #[tokio::test]
    async fn fund_without_slot_rejected() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.fund_quote(&session("nope"), 100).await.is_err());
    }

    #[tokio::test]
    async fn complete_unfunded_rejected() {
        let ledger = InMemoryLedger::new();
        let id = session("s1");
        ledger.create_quote(&id, &addr(1), 100).await.unwrap();
        assert!(ledger.complete_quote(&id, &addr(2)).await.is_err());
    }

    #[tokio::test]
    async fn underfunded_slot_reports_partial_amount() {
        let ledger = InMemoryLedger::new();
        let id = session("s1");
        ledger.create_quote(&id, &addr(1), 17_000).await.unwrap();
        ledger.fund_quote(&id, 8_000).await.unwrap();
        let status = ledger.verify_quote_funded(&id).await.unwrap();
        assert!(status.funded);
        assert_eq!(status.usdc_base_units, 8_000);
    }

    #[tokio::test]
    async fn refund_blocks_completion() {
        let ledger = InMemoryLedger::new();
        let id = session("s1");
        ledger.create_quote(&id, &addr(1), 100).await.unwrap();
        ledger.fund_quote(&id, 100).await.unwrap();
        ledger.refund_quote(&id).await.unwrap();
        assert!(ledger.complete_quote(&id, &addr(2)).await.is_err());
    }

    #[tokio::test]
    async fn permissive_ledger_admits_unknown_accounts() {
        let ledger = InMemoryLedger::new();
        let status = ledger.check_opted_in_to_asset(&addr(9), 7).await.unwrap();
        assert!(status.opted_in);
    }

    #[tokio::test]
    async fn strict_ledger_rejects_unknown_accounts() {
        let ledger = InMemoryLedger::strict();
        let status = ledger.check_opted_in_to_asset(&addr(9), 7).await.unwrap();
        assert!(!status.opted_in);

        ledger.register_account(&addr(9), 500);
        let status = ledger.check_opted_in_to_asset(&addr(9), 7).await.unwrap();
        assert!(status.opted_in);
        assert_eq!(status.balance, 500);
    }

    #[tokio::test]
    async fn alias_resolution_validates_shape() {
        let ledger = InMemoryLedger::new();
        ledger.add_alias(
            "boot-eu.diiisco.net",
            "/dns4/boot-eu.example.org/tcp/8777/p2p/12D3KooWAbc",
        );
        ledger.add_alias("bad.diiisco.net", "/ip6/::1/tcp/8777/p2p/12D3KooWAbc");

        assert!(ledger.resolve_alias("boot-eu.diiisco.net").await.is_ok());
        assert!(ledger.resolve_alias("bad.diiisco.net").await.is_err());
        assert!(ledger.resolve_alias("unknown.diiisco.net").await.is_err());
    }
}
