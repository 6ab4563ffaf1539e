//! Session store and workflow guards.
//!
//! One entry per in-flight session id, holding which side of the
//! trade this node plays, the current state on that side's path, and
//! the request/quote context handlers need later in the exchange.
//! Transitions are validated against the fixed paths; anything else
//! drops the session. Handlers for the same session id serialize on a
//! per-session guard; distinct ids run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use diiisco_protocol::{CustomerState, ProviderState, Quote};
use diiisco_types::{DiiiscoError, Result, SessionId};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Which side of the trade this node plays for a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionSide {
    /// We published the quote request.
    Customer,
    /// We answered it with a quote.
    Provider,
}

/// State on the owning side's path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    /// Customer-path state.
    Customer(CustomerState),
    /// Provider-path state.
    Provider(ProviderState),
}

/// One in-flight session.
#[derive(Clone, Debug)]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Which side we play.
    pub side: SessionSide,
    /// Current state.
    pub phase: SessionPhase,
    /// Original request body (customer) or inputs (provider).
    pub request: Option<Value>,
    /// The quote in play, once known.
    pub quote: Option<Quote>,
    /// Counterparty peer id, once known.
    pub peer: Option<String>,
    created_at: Instant,
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Cloneable store of in-flight sessions.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
    guards: Arc<Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-session guard serializing handlers for one id.
    pub fn guard(&self, id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = lock(&self.guards);
        Arc::clone(guards.entry(id.clone()).or_default())
    }

    /// Opens a customer session in `Discovering`.
    ///
    /// A second session with the same id is dropped silently by the
    /// caller; this returns the error to make that explicit.
    pub fn insert_customer(&self, id: SessionId, request: Value) -> Result<()> {
        self.insert(Session {
            id: id.clone(),
            side: SessionSide::Customer,
            phase: SessionPhase::Customer(CustomerState::Discovering),
            request: Some(request),
            quote: None,
            peer: None,
            created_at: Instant::now(),
        })
    }

    /// Opens a provider session in `QuoteOffered`.
    pub fn insert_provider(&self, id: SessionId, request: Value, quote: Quote) -> Result<()> {
        self.insert(Session {
            id: id.clone(),
            side: SessionSide::Provider,
            phase: SessionPhase::Provider(ProviderState::QuoteOffered),
            request: Some(request),
            quote: Some(quote),
            peer: None,
            created_at: Instant::now(),
        })
    }

    fn insert(&self, session: Session) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&session.id) {
            return Err(DiiiscoError::SessionError {
                reason: format!("duplicate session id {}", session.id),
            });
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Snapshot of a session.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        lock(&self.sessions).get(id).cloned()
    }

    /// Advances a customer session one step along its path.
    pub fn advance_customer(&self, id: &SessionId, next: CustomerState) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        let session = sessions.get_mut(id).ok_or_else(|| no_session(id))?;
        match session.phase {
            SessionPhase::Customer(current) if current.can_advance_to(next) => {
                tracing::debug!(%id, from = %current, to = %next, "customer session advanced");
                session.phase = SessionPhase::Customer(next);
                Ok(())
            }
            SessionPhase::Customer(current) => Err(DiiiscoError::SessionError {
                reason: format!("invalid customer transition {current} -> {next} for {id}"),
            }),
            SessionPhase::Provider(_) => Err(DiiiscoError::SessionError {
                reason: format!("session {id} is provider-side"),
            }),
        }
    }

    /// Advances a provider session one step along its path.
    pub fn advance_provider(&self, id: &SessionId, next: ProviderState) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        let session = sessions.get_mut(id).ok_or_else(|| no_session(id))?;
        match session.phase {
            SessionPhase::Provider(current) if current.can_advance_to(next) => {
                tracing::debug!(%id, from = %current, to = %next, "provider session advanced");
                session.phase = SessionPhase::Provider(next);
                Ok(())
            }
            SessionPhase::Provider(current) => Err(DiiiscoError::SessionError {
                reason: format!("invalid provider transition {current} -> {next} for {id}"),
            }),
            SessionPhase::Customer(_) => Err(DiiiscoError::SessionError {
                reason: format!("session {id} is customer-side"),
            }),
        }
    }

    /// Records the accepted quote and counterparty peer.
    pub fn set_deal(&self, id: &SessionId, quote: Quote, peer: Option<String>) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        let session = sessions.get_mut(id).ok_or_else(|| no_session(id))?;
        session.quote = Some(quote);
        if peer.is_some() {
            session.peer = peer;
        }
        Ok(())
    }

    /// Drops a session (terminal state or unrecoverable error).
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        lock(&self.guards).remove(id);
        lock(&self.sessions).remove(id)
    }

    /// Evicts sessions older than `ttl`; returns how many went.
    pub fn prune_older_than(&self, ttl: Duration) -> usize {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, s| s.created_at.elapsed() < ttl);
        let pruned = before - sessions.len();

        let mut guards = lock(&self.guards);
        guards.retain(|id, _| sessions.contains_key(id));
        pruned
    }

    /// Number of in-flight sessions.
    pub fn count(&self) -> usize {
        lock(&self.sessions).len()
    }
}

fn no_session(id: &SessionId) -> DiiiscoError {
    DiiiscoError::SessionError {
        reason: format!("no session {id}"),
    }
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
    use serde_json::json;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn quote() -> Quote {
        Quote {
            model: "m".into(),
            input_count: 1,
            token_count: 100,
            price_per_million: 0.02,
            total_price: 0.000002,
            addr: "ADDR".into(),
        }
    }

    #[test]
    fn duplicate_ids_rejected() {
        let store = SessionStore::new();
        store.insert_customer(sid("a"), json!({})).unwrap();
        assert!(store.insert_customer(sid("a"), json!({})).is_err());
        assert!(store
            .insert_provider(sid("a"), json!({}), quote())
            .is_err());
    }

    #[test]
    fn customer_walks_full_path() {
        let store = SessionStore::new();
        let id = sid("a");
        store.insert_customer(id.clone(), json!({})).unwrap();

        store.advance_customer(&id, CustomerState::Quoted).unwrap();
        store.advance_customer(&id, CustomerState::Accepted).unwrap();
        store
            .advance_customer(&id, CustomerState::ContractSignedSent)
            .unwrap();
        store.advance_customer(&id, CustomerState::Paid).unwrap();
    }

    #[test]
    fn customer_cannot_skip_states() {
        let store = SessionStore::new();
        let id = sid("a");
        store.insert_customer(id.clone(), json!({})).unwrap();
        assert!(store.advance_customer(&id, CustomerState::Paid).is_err());
    }

    #[test]
    fn provider_walks_full_path() {
        let store = SessionStore::new();
        let id = sid("a");
        store.insert_provider(id.clone(), json!({}), quote()).unwrap();

        store
            .advance_provider(&id, ProviderState::ContractCreatedSent)
            .unwrap();
        store.advance_provider(&id, ProviderState::Inferring).unwrap();
        store.advance_provider(&id, ProviderState::Responded).unwrap();
    }

    #[test]
    fn side_mismatch_rejected() {
        let store = SessionStore::new();
        let id = sid("a");
        store.insert_customer(id.clone(), json!({})).unwrap();
        assert!(store
            .advance_provider(&id, ProviderState::ContractCreatedSent)
            .is_err());
    }

    #[test]
    fn remove_clears_guard() {
        let store = SessionStore::new();
        let id = sid("a");
        store.insert_customer(id.clone(), json!({})).unwrap();
        let _guard = store.guard(&id);
        store.remove(&id);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn prune_evicts_by_age() {
        let store = SessionStore::new();
        store.insert_customer(sid("a"), json!({})).unwrap();
        assert_eq!(store.prune_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(store.prune_older_than(Duration::ZERO), 1);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn guard_serializes_same_id() {
        let store = SessionStore::new();
        let id = sid("a");
        let g1 = store.guard(&id);
        let g2 = store.guard(&id);
        let held = g1.lock().await;
        assert!(g2.try_lock().is_err());
        drop(held);
        assert!(g2.try_lock().is_ok());
    }
}
