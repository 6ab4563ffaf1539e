//! Keyed one-shot rendezvous bus.
//!
//! Correlates asynchronous replies to an outstanding in-flight
//! request: a waiter registers a key *before* publishing, then awaits
//! the one-shot receiver with a deadline. Completing a key consumes
//! the slot, so at most one event is ever delivered per registration.
//! Unclaimed keys are cancelled by the waiter on timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use diiisco_protocol::{Envelope, QuoteBid};
use diiisco_types::SessionId;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events delivered through the rendezvous bus.
#[derive(Debug)]
pub enum BusEvent {
    /// The auction closed and selected this winning bid.
    QuoteSelected(QuoteBid),
    /// The provider's completion arrived for the session.
    InferenceResponse(Envelope),
    /// The session reached its terminal paid state.
    SessionComplete(SessionId),
}

/// Key for the auction-winner event of a session.
pub fn quote_selected_key(id: &SessionId) -> String {
    format!("quote-selected-{id}")
}

/// Key for the completion event of a session.
pub fn inference_response_key(id: &SessionId) -> String {
    format!("inference-response-{id}")
}

/// Key for the terminal session-complete event.
pub fn session_complete_key(id: &SessionId) -> String {
    format!("session-complete-{id}")
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Cloneable handle to the rendezvous map.
#[derive(Clone, Default)]
pub struct EventBus {
    slots: Arc<Mutex<HashMap<String, oneshot::Sender<BusEvent>>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `key`, replacing any stale one.
    ///
    /// Must be called before the action that triggers the event, or
    /// the completion races the registration.
    pub fn register(&self, key: impl Into<String>) -> oneshot::Receiver<BusEvent> {
        let (tx, rx) = oneshot::channel();
        lock(&self.slots).insert(key.into(), tx);
        rx
    }

    /// Completes `key`, delivering `event` to the registered waiter.
    ///
    /// Returns whether a waiter existed and was still listening.
    pub fn complete(&self, key: &str, event: BusEvent) -> bool {
        let sender = lock(&self.slots).remove(key);
        match sender {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Drops the registration for `key`, if any.
    pub fn cancel(&self, key: &str) {
        lock(&self.slots).remove(key);
    }

    /// Number of outstanding registrations.
    pub fn pending(&self) -> usize {
        lock(&self.slots).len()
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

    fn session(id: &str) -> SessionId {
        SessionId::new(id).unwrap()
    }

    #[tokio::test]
    async fn register_then_complete_delivers() {
        let bus = EventBus::new();
        let rx = bus.register("key-1");

        assert!(bus.complete("key-1", BusEvent::SessionComplete(session("s"))));
        assert!(matches!(
            rx.await.unwrap(),
            BusEvent::SessionComplete(_)
        ));
    }

    #[tokio::test]
    async fn complete_without_listener_is_false() {
        let bus = EventBus::new();
        assert!(!bus.complete("nobody", BusEvent::SessionComplete(session("s"))));
    }

    #[tokio::test]
    async fn second_complete_is_dropped() {
        let bus = EventBus::new();
        let _rx = bus.register("key-1");

        assert!(bus.complete("key-1", BusEvent::SessionComplete(session("a"))));
        // The slot is consumed; a second event has nowhere to go.
        assert!(!bus.complete("key-1", BusEvent::SessionComplete(session("b"))));
    }

    #[tokio::test]
    async fn cancel_removes_registration() {
        let bus = EventBus::new();
        let rx = bus.register("key-1");
        bus.cancel("key-1");

        assert_eq!(bus.pending(), 0);
        assert!(!bus.complete("key-1", BusEvent::SessionComplete(session("s"))));
        assert!(rx.await.is_err());
    }

    #[test]
    fn keys_embed_session_id() {
        let id = session("abc");
        assert_eq!(quote_selected_key(&id), "quote-selected-abc");
        assert_eq!(inference_response_key(&id), "inference-response-abc");
        assert_eq!(session_complete_key(&id), "session-complete-abc");
    }
}
