//! End-to-end exchanges between a customer and provider processor,
//! wired through in-memory channels with a shared ledger.
//!
//! These cover the full session workflow without a live swarm: the
//! auction window, the four post-selection messages, settlement, the
//! tampered-bid drop, and the underfunded abort.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use diiisco_ledger::{InMemoryLedger, LedgerClient, QuoteStatus, Wallet};
use diiisco_model::{ModelAccumulator, ModelClient};
use diiisco_node::auction::QuoteAuction;
use diiisco_node::bus::{
    inference_response_key, quote_selected_key, session_complete_key, BusEvent, EventBus,
};
use diiisco_node::pricing::QuotePipeline;
use diiisco_node::processor::MessageProcessor;
use diiisco_node::router::OutboundMessage;
use diiisco_node::sessions::SessionStore;
use diiisco_protocol::envelope::Role;
use diiisco_protocol::signing::{sign_envelope, verify_envelope};
use diiisco_protocol::{CustomerState, Envelope};
use diiisco_types::config::SelectionPolicy;
use diiisco_types::{now_millis, ChatMessage, DiiiscoError, ModelInfo, Result, SessionId};

const AUCTION_WINDOW: Duration = Duration::from_millis(40);
const ASSET_ID: u64 = 7;

// ---------------------------------------------------------------------------
// Test model runtime
// ---------------------------------------------------------------------------

struct StaticModel;

#[async_trait]
impl ModelClient for StaticModel {
    async fn get_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: "gpt-oss:20b".into(),
            object: "model".into(),
            created: 0,
            owned_by: "test".into(),
        }])
    }

    async fn get_response(&self, model: &str, _: &[ChatMessage]) -> Result<Value> {
        Ok(json!({
            "model": model,
            "choices": [{ "message": { "role": "assistant", "content": "42" } }]
        }))
    }

    async fn count_embeddings(&self, _: &str, inputs: &[ChatMessage]) -> Result<u64> {
        Ok(diiisco_model::estimate_tokens(inputs))
    }
}

// ---------------------------------------------------------------------------
// Peer fixture
// ---------------------------------------------------------------------------

struct Peer {
    peer_id: PeerId,
    wallet: Arc<Wallet>,
    processor: MessageProcessor,
    outbox: mpsc::UnboundedReceiver<OutboundMessage>,
    bus: EventBus,
    sessions: SessionStore,
}

fn make_peer(
    seed: u8,
    models_enabled: bool,
    rate: f64,
    ledger: Arc<InMemoryLedger>,
) -> Peer {
    let peer_id = PeerId::random();
    let wallet = Arc::new(Wallet::from_seed(&[seed; 32]));
    let model: Arc<dyn ModelClient> = Arc::new(StaticModel);
    let bus = EventBus::new();
    let sessions = SessionStore::new();
    let auction = QuoteAuction::new(
        AUCTION_WINDOW,
        SelectionPolicy::Cheapest,
        ledger.clone(),
        ASSET_ID,
        bus.clone(),
    );
    let pipeline =
        QuotePipeline::from_config(&["embedding-rate".into()], model.clone(), rate).unwrap();
    let (outbox_tx, outbox) = mpsc::unbounded_channel();

    let processor = MessageProcessor::new(
        peer_id.to_string(),
        wallet.clone(),
        ledger,
        model,
        models_enabled,
        ModelAccumulator::new(AUCTION_WINDOW),
        pipeline,
        auction,
        sessions.clone(),
        bus.clone(),
        outbox_tx,
        ASSET_ID,
    );

    Peer {
        peer_id,
        wallet,
        processor,
        outbox,
        bus,
        sessions,
    }
}

fn request_body() -> Value {
    json!({
        "model": "gpt-oss:20b",
        "inputs": [{ "role": "user", "content": "x".repeat(1000) }]
    })
}

fn quote_request(customer: &Peer, id: &SessionId) -> Envelope {
    let mut envelope = Envelope::new(
        Role::QuoteRequest,
        id.clone(),
        now_millis(),
        customer.wallet.address().as_str(),
        None,
        Some(request_body()),
    );
    sign_envelope(&mut envelope, customer.wallet.signing_key()).unwrap();
    envelope
}

/// Runs the post-selection exchange, returning the customer-side
/// error if any step aborts.
async fn run_contract_exchange(
    customer: &mut Peer,
    provider: &mut Peer,
    id: &SessionId,
    accepted_payload: Value,
) -> std::result::Result<(), DiiiscoError> {
    // Customer accepts the winning quote.
    let mut accepted = Envelope::new(
        Role::QuoteAccepted,
        id.clone(),
        now_millis(),
        customer.wallet.address().as_str(),
        Some(provider.peer_id.to_string()),
        Some(accepted_payload),
    );
    sign_envelope(&mut accepted, customer.wallet.signing_key()).unwrap();
    provider
        .processor
        .process(accepted, customer.peer_id)
        .await?;

    // Provider replies contract-created.
    let created = provider.outbox.try_recv().expect("contract-created").envelope;
    assert_eq!(created.role, Role::ContractCreated);
    customer
        .processor
        .process(created, provider.peer_id)
        .await?;

    // Customer replies contract-signed.
    let signed = customer.outbox.try_recv().expect("contract-signed").envelope;
    assert_eq!(signed.role, Role::ContractSigned);
    provider.processor.process(signed, customer.peer_id).await?;

    // Provider replies inference-response.
    let response = provider
        .outbox
        .try_recv()
        .expect("inference-response")
        .envelope;
    assert_eq!(response.role, Role::InferenceResponse);
    customer
        .processor
        .process(response, provider.peer_id)
        .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_settles_exactly_once() {
    let ledger = Arc::new(InMemoryLedger::new());
    let mut customer = make_peer(0x01, false, 0.0, ledger.clone());
    let mut provider = make_peer(0x02, true, 0.02, ledger.clone());

    let id = SessionId::new("s-happy").unwrap();
    customer
        .sessions
        .insert_customer(id.clone(), request_body())
        .unwrap();
    let selected_rx = customer.bus.register(quote_selected_key(&id));
    let response_rx = customer.bus.register(inference_response_key(&id));
    let complete_rx = customer.bus.register(session_complete_key(&id));

    // Broadcast quote-request reaches the provider.
    provider
        .processor
        .process(quote_request(&customer, &id), customer.peer_id)
        .await
        .unwrap();

    // The bid travels back and opens the customer's auction window.
    let bid = provider.outbox.try_recv().unwrap().envelope;
    assert_eq!(bid.role, Role::QuoteResponse);
    assert!(verify_envelope(&bid).is_ok());
    customer
        .processor
        .process(bid.clone(), provider.peer_id)
        .await
        .unwrap();

    // Window closes, winner selected exactly once.
    let winner = match selected_rx.await.unwrap() {
        BusEvent::QuoteSelected(bid) => bid,
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(winner.from_peer_id, provider.peer_id.to_string());
    assert!(winner.quote.usdc_base_units() > 0);

    // Façade-side bookkeeping before sending the acceptance.
    customer
        .sessions
        .set_deal(&id, winner.quote.clone(), Some(winner.from_peer_id.clone()))
        .unwrap();
    customer
        .sessions
        .advance_customer(&id, CustomerState::Accepted)
        .unwrap();

    run_contract_exchange(&mut customer, &mut provider, &id, bid.payload.unwrap())
        .await
        .unwrap();

    // Completion reached the waiting façade listeners.
    match response_rx.await.unwrap() {
        BusEvent::InferenceResponse(envelope) => {
            let completion = &envelope.payload.unwrap()["completion"];
            assert_eq!(
                completion["choices"][0]["message"]["content"],
                json!("42")
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        complete_rx.await.unwrap(),
        BusEvent::SessionComplete(_)
    ));

    // Escrow settled exactly once; both sessions retired.
    assert_eq!(ledger.slot_status(&id), Some(QuoteStatus::Completed));
    assert_eq!(customer.sessions.count(), 0);
    assert_eq!(provider.sessions.count(), 0);

    let paid = ledger
        .check_opted_in_to_asset(provider.wallet.address(), ASSET_ID)
        .await
        .unwrap();
    assert_eq!(paid.balance, winner.quote.usdc_base_units());
}

#[tokio::test]
async fn cheapest_of_two_bidders_wins() {
    let ledger = Arc::new(InMemoryLedger::new());
    let mut customer = make_peer(0x01, false, 0.0, ledger.clone());
    let mut expensive = make_peer(0x02, true, 0.02, ledger.clone());
    let mut cheap = make_peer(0x03, true, 0.017, ledger.clone());

    let id = SessionId::new("s-auction").unwrap();
    customer
        .sessions
        .insert_customer(id.clone(), request_body())
        .unwrap();
    let selected_rx = customer.bus.register(quote_selected_key(&id));

    let request = quote_request(&customer, &id);
    expensive
        .processor
        .process(request.clone(), customer.peer_id)
        .await
        .unwrap();
    cheap
        .processor
        .process(request, customer.peer_id)
        .await
        .unwrap();

    for (peer, source) in [
        (&mut expensive.outbox, expensive.peer_id),
        (&mut cheap.outbox, cheap.peer_id),
    ] {
        let bid = peer.try_recv().unwrap().envelope;
        customer.processor.process(bid, source).await.unwrap();
    }

    let winner = match selected_rx.await.unwrap() {
        BusEvent::QuoteSelected(bid) => bid,
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(winner.from_peer_id, cheap.peer_id.to_string());
    assert_eq!(winner.quote.price_per_million, 0.017);
}

#[tokio::test]
async fn tampered_bid_is_invisible_to_the_auction() {
    let ledger = Arc::new(InMemoryLedger::new());
    let mut customer = make_peer(0x01, false, 0.0, ledger.clone());
    let mut provider = make_peer(0x02, true, 0.02, ledger.clone());

    let id = SessionId::new("s-tamper").unwrap();
    customer
        .sessions
        .insert_customer(id.clone(), request_body())
        .unwrap();
    let mut selected_rx = customer.bus.register(quote_selected_key(&id));

    provider
        .processor
        .process(quote_request(&customer, &id), customer.peer_id)
        .await
        .unwrap();
    let mut bid = provider.outbox.try_recv().unwrap().envelope;

    // Halve the price in flight.
    let mut payload = bid.payload.take().unwrap();
    payload["quote"]["totalPrice"] = json!(0.0000025);
    bid.payload = Some(payload);

    let result = customer.processor.process(bid, provider.peer_id).await;
    assert!(matches!(result, Err(DiiiscoError::BadSignature)));

    // No bid recorded: the window never opened, nothing fires.
    tokio::time::sleep(AUCTION_WINDOW * 3).await;
    assert!(selected_rx.try_recv().is_err());
}

#[tokio::test]
async fn underfunded_contract_aborts_before_inference() {
    let ledger = Arc::new(InMemoryLedger::new());
    let mut customer = make_peer(0x01, false, 0.0, ledger.clone());
    let mut provider = make_peer(0x02, true, 0.02, ledger.clone());

    let id = SessionId::new("s-underfunded").unwrap();
    customer
        .sessions
        .insert_customer(id.clone(), request_body())
        .unwrap();
    let selected_rx = customer.bus.register(quote_selected_key(&id));

    provider
        .processor
        .process(quote_request(&customer, &id), customer.peer_id)
        .await
        .unwrap();
    let bid = provider.outbox.try_recv().unwrap().envelope;
    customer
        .processor
        .process(bid.clone(), provider.peer_id)
        .await
        .unwrap();

    let winner = match selected_rx.await.unwrap() {
        BusEvent::QuoteSelected(bid) => bid,
        other => panic!("unexpected event: {other:?}"),
    };
    assert!(winner.quote.usdc_base_units() > 1);

    // The customer "accepts" a lowballed copy, so its funding falls
    // short of the provider's quoted total.
    let mut lowball = winner.quote.clone();
    lowball.total_price = 0.000001;
    customer
        .sessions
        .set_deal(&id, lowball, Some(winner.from_peer_id.clone()))
        .unwrap();
    customer
        .sessions
        .advance_customer(&id, CustomerState::Accepted)
        .unwrap();

    let err = run_contract_exchange(&mut customer, &mut provider, &id, bid.payload.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, DiiiscoError::Underfunded { .. }));

    // No inference-response was produced and no payment settled.
    assert!(provider.outbox.try_recv().is_err());
    assert_ne!(ledger.slot_status(&id), Some(QuoteStatus::Completed));
    assert_eq!(provider.sessions.count(), 0);
}

#[tokio::test]
async fn duplicate_inference_response_settles_once() {
    let ledger = Arc::new(InMemoryLedger::new());
    let mut customer = make_peer(0x01, false, 0.0, ledger.clone());
    let mut provider = make_peer(0x02, true, 0.02, ledger.clone());

    let id = SessionId::new("s-dup").unwrap();
    customer
        .sessions
        .insert_customer(id.clone(), request_body())
        .unwrap();
    let selected_rx = customer.bus.register(quote_selected_key(&id));

    provider
        .processor
        .process(quote_request(&customer, &id), customer.peer_id)
        .await
        .unwrap();
    let bid = provider.outbox.try_recv().unwrap().envelope;
    customer
        .processor
        .process(bid.clone(), provider.peer_id)
        .await
        .unwrap();

    let winner = match selected_rx.await.unwrap() {
        BusEvent::QuoteSelected(bid) => bid,
        other => panic!("unexpected event: {other:?}"),
    };
    customer
        .sessions
        .set_deal(&id, winner.quote, Some(winner.from_peer_id))
        .unwrap();
    customer
        .sessions
        .advance_customer(&id, CustomerState::Accepted)
        .unwrap();

    // Capture the inference-response to replay it afterwards.
    let mut accepted = Envelope::new(
        Role::QuoteAccepted,
        id.clone(),
        now_millis(),
        customer.wallet.address().as_str(),
        Some(provider.peer_id.to_string()),
        Some(bid.payload.unwrap()),
    );
    sign_envelope(&mut accepted, customer.wallet.signing_key()).unwrap();
    provider
        .processor
        .process(accepted, customer.peer_id)
        .await
        .unwrap();
    let created = provider.outbox.try_recv().unwrap().envelope;
    customer
        .processor
        .process(created, provider.peer_id)
        .await
        .unwrap();
    let signed = customer.outbox.try_recv().unwrap().envelope;
    provider
        .processor
        .process(signed, customer.peer_id)
        .await
        .unwrap();
    let response = provider.outbox.try_recv().unwrap().envelope;

    customer
        .processor
        .process(response.clone(), provider.peer_id)
        .await
        .unwrap();
    assert_eq!(ledger.slot_status(&id), Some(QuoteStatus::Completed));

    // Replay: the session is gone, so the duplicate is dropped and
    // no second settlement is attempted.
    customer
        .processor
        .process(response, provider.peer_id)
        .await
        .unwrap();
    assert_eq!(ledger.slot_status(&id), Some(QuoteStatus::Completed));
}
