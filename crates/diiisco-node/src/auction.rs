//! Quote auction engine.
//!
//! The first bid for a session id opens a bid list and arms a
//! one-shot window timer. Further bids append until the window
//! closes; the configured selection policy then picks a winner, the
//! `quote-selected-<id>` rendezvous fires exactly once, and the list
//! is deleted. A closed session leaves a tombstone so late bids are
//! discarded instead of opening a fresh window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;

use diiisco_ledger::LedgerClient;
use diiisco_protocol::QuoteBid;
use diiisco_types::config::SelectionPolicy;
use diiisco_types::{SessionId, WalletAddr};

use crate::bus::{quote_selected_key, BusEvent, EventBus};

/// Tombstones older than this many windows are pruned.
const TOMBSTONE_WINDOWS: u32 = 10;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

enum AuctionEntry {
    Open {
        bids: Vec<QuoteBid>,
        timer: JoinHandle<()>,
    },
    Closed {
        at: Instant,
    },
}

struct Inner {
    entries: Mutex<HashMap<SessionId, AuctionEntry>>,
    wait: Duration,
    policy: SelectionPolicy,
    ledger: Arc<dyn LedgerClient>,
    asset_id: u64,
    bus: EventBus,
}

/// Cloneable handle to the auction engine.
#[derive(Clone)]
pub struct QuoteAuction {
    inner: Arc<Inner>,
}

impl QuoteAuction {
    /// Creates an auction engine with the given window and policy.
    pub fn new(
        wait: Duration,
        policy: SelectionPolicy,
        ledger: Arc<dyn LedgerClient>,
        asset_id: u64,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                wait,
                policy,
                ledger,
                asset_id,
                bus,
            }),
        }
    }

    /// Buffers a bid; the first bid for a session arms the window.
    ///
    /// Bids for closed sessions are discarded.
    pub fn add_bid(&self, id: SessionId, bid: QuoteBid) {
        use std::collections::hash_map::Entry;

        let mut entries = lock(&self.inner.entries);

        // Opportunistic tombstone pruning.
        let horizon = self.inner.wait * TOMBSTONE_WINDOWS;
        entries.retain(|_, entry| match entry {
            AuctionEntry::Closed { at } => at.elapsed() < horizon,
            AuctionEntry::Open { .. } => true,
        });

        match entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                AuctionEntry::Open { bids, .. } => {
                    tracing::debug!(%id, peer = %bid.from_peer_id, "bid appended");
                    bids.push(bid);
                }
                AuctionEntry::Closed { .. } => {
                    tracing::debug!(%id, peer = %bid.from_peer_id, "late bid discarded");
                }
            },
            Entry::Vacant(vacant) => {
                tracing::debug!(%id, peer = %bid.from_peer_id, "auction window opened");
                let inner = Arc::clone(&self.inner);
                let timer_id = id.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(inner.wait).await;
                    close_window(&inner, &timer_id).await;
                });
                vacant.insert(AuctionEntry::Open {
                    bids: vec![bid],
                    timer,
                });
            }
        }
    }

    /// Number of open windows, for status reporting.
    pub fn open_windows(&self) -> usize {
        lock(&self.inner.entries)
            .values()
            .filter(|e| matches!(e, AuctionEntry::Open { .. }))
            .count()
    }

    /// Aborts every pending window timer.
    pub fn shutdown(&self) {
        let mut entries = lock(&self.inner.entries);
        for (_, entry) in entries.drain() {
            if let AuctionEntry::Open { timer, .. } = entry {
                timer.abort();
            }
        }
    }
}

/// Closes the window for `id`: select, emit, tombstone.
async fn close_window(inner: &Inner, id: &SessionId) {
    let bids = {
        let mut entries = lock(&inner.entries);
        match entries.insert(id.clone(), AuctionEntry::Closed { at: Instant::now() }) {
            Some(AuctionEntry::Open { bids, .. }) => bids,
            _ => return,
        }
    };

    let winner = select_winner(inner, &bids).await;
    match winner {
        Some(bid) => {
            tracing::info!(
                %id,
                winner = %bid.from_peer_id,
                total_price = bid.quote.total_price,
                bid_count = bids.len(),
                "auction closed"
            );
            let delivered = inner
                .bus
                .complete(&quote_selected_key(id), BusEvent::QuoteSelected(bid));
            if !delivered {
                tracing::debug!(%id, "auction winner had no listener");
            }
        }
        None => {
            tracing::debug!(%id, "auction closed with no selectable bid");
        }
    }
}

// ---------------------------------------------------------------------------
// Selection policies
// ---------------------------------------------------------------------------

async fn select_winner(inner: &Inner, bids: &[QuoteBid]) -> Option<QuoteBid> {
    if bids.is_empty() {
        return None;
    }
    match inner.policy {
        SelectionPolicy::Cheapest => select_cheapest(bids),
        SelectionPolicy::First => bids.first().cloned(),
        SelectionPolicy::Random => {
            let index = rand::thread_rng().gen_range(0..bids.len());
            bids.get(index).cloned()
        }
        SelectionPolicy::HighestStake => {
            select_highest_stake(bids, inner.ledger.as_ref(), inner.asset_id).await
        }
    }
}

/// Minimum total price; ties broken by arrival order.
fn select_cheapest(bids: &[QuoteBid]) -> Option<QuoteBid> {
    let mut best: Option<&QuoteBid> = None;
    for bid in bids {
        match best {
            Some(current) if bid.quote.total_price >= current.quote.total_price => {}
            _ => best = Some(bid),
        }
    }
    best.cloned()
}

/// Maximum protocol-asset balance; ties broken by arrival order.
///
/// Performs one ledger lookup per bidder; an unreadable balance
/// counts as zero rather than failing the whole auction.
async fn select_highest_stake(
    bids: &[QuoteBid],
    ledger: &dyn LedgerClient,
    asset_id: u64,
) -> Option<QuoteBid> {
    let mut best: Option<(&QuoteBid, u64)> = None;
    for bid in bids {
        let balance = match bid.quote.addr.parse::<WalletAddr>() {
            Ok(addr) => match ledger.check_opted_in_to_asset(&addr, asset_id).await {
                Ok(status) => status.balance,
                Err(e) => {
                    tracing::warn!(addr = %bid.quote.addr, %e, "stake lookup failed");
                    0
                }
            },
            Err(_) => 0,
        };
        match best {
            Some((_, current)) if balance <= current => {}
            _ => best = Some((bid, balance)),
        }
    }
    best.map(|(bid, _)| bid.clone())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use diiisco_ledger::InMemoryLedger;
    use diiisco_protocol::Quote;

    fn bid(peer: &str, price: f64, addr: &WalletAddr) -> QuoteBid {
        QuoteBid {
            from_peer_id: peer.into(),
            quote: Quote {
                model: "gpt-oss:20b".into(),
                input_count: 1,
                token_count: 100,
                price_per_million: 0.02,
                total_price: price,
                addr: addr.as_str().into(),
            },
        }
    }

    fn addr(byte: u8) -> WalletAddr {
        WalletAddr::from_public_key(&[byte; 32])
    }

    fn engine(policy: SelectionPolicy, ledger: Arc<InMemoryLedger>) -> (QuoteAuction, EventBus) {
        let bus = EventBus::new();
        let auction = QuoteAuction::new(
            Duration::from_millis(30),
            policy,
            ledger,
            7,
            bus.clone(),
        );
        (auction, bus)
    }

    #[tokio::test]
    async fn cheapest_bid_wins_within_window() {
        let (auction, bus) = engine(SelectionPolicy::Cheapest, Arc::new(InMemoryLedger::new()));
        let id = SessionId::new("s1").unwrap();
        let rx = bus.register(quote_selected_key(&id));

        auction.add_bid(id.clone(), bid("p1", 0.02, &addr(1)));
        auction.add_bid(id.clone(), bid("p2", 0.017, &addr(2)));

        match rx.await.unwrap() {
            BusEvent::QuoteSelected(winner) => assert_eq!(winner.from_peer_id, "p2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_policy_keeps_arrival_order() {
        let (auction, bus) = engine(SelectionPolicy::First, Arc::new(InMemoryLedger::new()));
        let id = SessionId::new("s1").unwrap();
        let rx = bus.register(quote_selected_key(&id));

        auction.add_bid(id.clone(), bid("p1", 0.05, &addr(1)));
        auction.add_bid(id.clone(), bid("p2", 0.01, &addr(2)));

        match rx.await.unwrap() {
            BusEvent::QuoteSelected(winner) => assert_eq!(winner.from_peer_id, "p1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cheapest_ties_break_by_arrival() {
        let bids = vec![
            bid("p1", 0.02, &addr(1)),
            bid("p2", 0.02, &addr(2)),
        ];
        assert_eq!(select_cheapest(&bids).unwrap().from_peer_id, "p1");
    }

    #[tokio::test]
    async fn highest_stake_consults_ledger() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.register_account(&addr(1), 100);
        ledger.register_account(&addr(2), 900);
        let (auction, bus) = engine(SelectionPolicy::HighestStake, ledger);

        let id = SessionId::new("s1").unwrap();
        let rx = bus.register(quote_selected_key(&id));

        auction.add_bid(id.clone(), bid("p1", 0.01, &addr(1)));
        auction.add_bid(id.clone(), bid("p2", 0.05, &addr(2)));

        match rx.await.unwrap() {
            BusEvent::QuoteSelected(winner) => assert_eq!(winner.from_peer_id, "p2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_bids_are_discarded() {
        let (auction, bus) = engine(SelectionPolicy::Cheapest, Arc::new(InMemoryLedger::new()));
        let id = SessionId::new("s1").unwrap();
        let rx = bus.register(quote_selected_key(&id));

        auction.add_bid(id.clone(), bid("p1", 0.02, &addr(1)));
        rx.await.unwrap();

        // Window closed; this must not reopen it.
        auction.add_bid(id.clone(), bid("p2", 0.001, &addr(2)));
        assert_eq!(auction.open_windows(), 0);

        // A fresh listener sees nothing for the same id.
        let mut rx2 = bus.register(quote_selected_key(&id));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn quote_selected_fires_at_most_once_per_id() {
        let (auction, bus) = engine(SelectionPolicy::Cheapest, Arc::new(InMemoryLedger::new()));
        let id = SessionId::new("s1").unwrap();
        let rx = bus.register(quote_selected_key(&id));

        for i in 0..5u8 {
            auction.add_bid(id.clone(), bid(&format!("p{i}"), 0.02, &addr(i + 1)));
        }
        rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(auction.open_windows(), 0);
    }

    #[tokio::test]
    async fn shutdown_aborts_open_windows() {
        let (auction, bus) = engine(SelectionPolicy::Cheapest, Arc::new(InMemoryLedger::new()));
        let id = SessionId::new("s1").unwrap();
        let mut rx = bus.register(quote_selected_key(&id));

        auction.add_bid(id.clone(), bid("p1", 0.02, &addr(1)));
        auction.shutdown();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(auction.open_windows(), 0);
    }
}
