//! Unified ingress message processor.
//!
//! Both transports feed the same `process(envelope, source)` — there
//! is exactly one authoritative validation and dispatch path.
//!
//! Pipeline, short-circuiting on the first failure:
//!
//! 1. addressing filter — envelopes carrying `to` for another node
//!    are dropped,
//! 2. sender address validation (`BadSender`),
//! 3. signature presence (`Unsigned`),
//! 4. canonical-JSON Ed25519 verification (`BadSignature`),
//! 5. role dispatch (`UnknownRole`).
//!
//! Rejected messages are logged and dropped, never replied to.
//! Handlers for the same session id serialize on the session guard;
//! distinct ids run in parallel.

use std::sync::Arc;

use libp2p::PeerId;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use diiisco_ledger::{LedgerClient, Wallet};
use diiisco_model::{ModelAccumulator, ModelClient};
use diiisco_protocol::envelope::Role;
use diiisco_protocol::quote::{quote_from_payload, round_price};
use diiisco_protocol::signing::{sign_envelope, verify_envelope};
use diiisco_protocol::{CustomerState, Envelope, ProviderState, Quote, QuoteBid};
use diiisco_types::{
    now_millis, ChatMessage, DiiiscoError, ModelInfo, Result, SessionId, WalletAddr,
};

use crate::auction::QuoteAuction;
use crate::bus::{inference_response_key, session_complete_key, BusEvent, EventBus};
use crate::pricing::QuotePipeline;
use crate::router::OutboundMessage;
use crate::sessions::{SessionPhase, SessionSide, SessionStore};

// ---------------------------------------------------------------------------
// MessageProcessor
// ---------------------------------------------------------------------------

/// Signature-verified, role-dispatching ingress processor.
///
/// Holds collaborator references only — session state lives in the
/// [`SessionStore`], bids in the [`QuoteAuction`].
pub struct MessageProcessor {
    own_peer_id: String,
    wallet: Arc<Wallet>,
    ledger: Arc<dyn LedgerClient>,
    model: Arc<dyn ModelClient>,
    models_enabled: bool,
    accumulator: ModelAccumulator,
    pipeline: QuotePipeline,
    auction: QuoteAuction,
    sessions: SessionStore,
    bus: EventBus,
    outbox: mpsc::UnboundedSender<OutboundMessage>,
    asset_id: u64,
}

impl MessageProcessor {
    /// Wires the processor to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        own_peer_id: String,
        wallet: Arc<Wallet>,
        ledger: Arc<dyn LedgerClient>,
        model: Arc<dyn ModelClient>,
        models_enabled: bool,
        accumulator: ModelAccumulator,
        pipeline: QuotePipeline,
        auction: QuoteAuction,
        sessions: SessionStore,
        bus: EventBus,
        outbox: mpsc::UnboundedSender<OutboundMessage>,
        asset_id: u64,
    ) -> Self {
        Self {
            own_peer_id,
            wallet,
            ledger,
            model,
            models_enabled,
            accumulator,
            pipeline,
            auction,
            sessions,
            bus,
            outbox,
            asset_id,
        }
    }

    /// Processes one inbound envelope from either transport.
    pub async fn process(&self, envelope: Envelope, source: PeerId) -> Result<()> {
        // 1. Addressing filter: roles that carry `to` are only for the
        //    named node; broadcast-by-design roles carry none.
        if let Some(to) = &envelope.to {
            if *to != self.own_peer_id {
                return Err(DiiiscoError::NotAddressedHere);
            }
        }

        // 2.-4. Sender address, signature presence, verification.
        verify_envelope(&envelope)?;

        // 5. Role dispatch.
        if !envelope.role.is_known() {
            return Err(DiiiscoError::UnknownRole {
                role: envelope.role.as_str().into(),
            });
        }

        // Serialize handlers per session id.
        let guard = self.sessions.guard(&envelope.id);
        let _serialized = guard.lock().await;

        match envelope.role.clone() {
            Role::ListModels => self.handle_list_models(&envelope, source).await,
            Role::ListModelsResponse => self.handle_list_models_response(&envelope),
            Role::QuoteRequest => self.handle_quote_request(&envelope, source).await,
            Role::QuoteResponse => self.handle_quote_response(&envelope, source),
            Role::QuoteAccepted => self.handle_quote_accepted(&envelope, source).await,
            Role::ContractCreated => self.handle_contract_created(&envelope, source).await,
            Role::ContractSigned => self.handle_contract_signed(&envelope, source).await,
            Role::InferenceResponse => self.handle_inference_response(&envelope).await,
            Role::Unknown(role) => Err(DiiiscoError::UnknownRole { role }),
        }
    }

    // -----------------------------------------------------------------------
    // Outbound replies
    // -----------------------------------------------------------------------

    /// Signs a reply exactly as received envelopes are verified and
    /// hands it to the egress router.
    fn reply(
        &self,
        role: Role,
        id: SessionId,
        to_peer: String,
        payload: Value,
        target: PeerId,
    ) -> Result<()> {
        let mut envelope = Envelope::new(
            role,
            id,
            now_millis(),
            self.wallet.address().as_str(),
            Some(to_peer),
            Some(payload),
        );
        sign_envelope(&mut envelope, self.wallet.signing_key())?;
        self.outbox
            .send(OutboundMessage {
                envelope,
                target: Some(target),
            })
            .map_err(|_| DiiiscoError::NetworkError {
                reason: "outbox closed".into(),
            })
    }

    // -----------------------------------------------------------------------
    // Broadcast roles
    // -----------------------------------------------------------------------

    async fn handle_list_models(&self, envelope: &Envelope, source: PeerId) -> Result<()> {
        if !self.models_enabled {
            tracing::debug!(id = %envelope.id, "list-models ignored, provider mode off");
            return Ok(());
        }

        let models = self.model.get_models().await?;
        self.reply(
            Role::ListModelsResponse,
            envelope.id.clone(),
            source.to_string(),
            json!({ "models": models }),
            source,
        )
    }

    fn handle_list_models_response(&self, envelope: &Envelope) -> Result<()> {
        let models: Vec<ModelInfo> = parse_field(envelope.payload.as_ref(), "models")?;
        tracing::debug!(count = models.len(), "provider model list received");
        self.accumulator.add_models(models);
        Ok(())
    }

    async fn handle_quote_request(&self, envelope: &Envelope, source: PeerId) -> Result<()> {
        if !self.models_enabled {
            tracing::debug!(id = %envelope.id, "quote-request ignored, provider mode off");
            return Ok(());
        }

        let model: String = parse_field(envelope.payload.as_ref(), "model")?;
        let inputs: Vec<ChatMessage> = parse_field(envelope.payload.as_ref(), "inputs")?;

        // A model we do not serve is not our auction.
        let served = self.model.get_models().await?;
        if !served.iter().any(|m| m.id == model) {
            return Err(DiiiscoError::ModelNotServed { model });
        }

        // The requester must hold the protocol asset before we spend
        // a slot on it.
        let requester: WalletAddr = envelope.from_wallet_addr.parse()?;
        let opt_in = self
            .ledger
            .check_opted_in_to_asset(&requester, self.asset_id)
            .await?;
        if !opt_in.opted_in {
            return Err(DiiiscoError::NotOptedIn {
                addr: requester.as_str().into(),
            });
        }

        let raw = self.pipeline.produce(&model, &inputs).await?;
        let quote = Quote {
            model: model.clone(),
            input_count: inputs.len() as u64,
            token_count: raw.tokens,
            price_per_million: raw.rate,
            total_price: round_price(raw.price),
            addr: self.wallet.address().as_str().into(),
        };

        let request_context = json!({ "model": model, "inputs": inputs });
        if self
            .sessions
            .insert_provider(envelope.id.clone(), request_context.clone(), quote.clone())
            .is_err()
        {
            tracing::debug!(id = %envelope.id, "duplicate quote-request dropped");
            return Ok(());
        }
        self.sessions
            .set_deal(&envelope.id, quote.clone(), Some(source.to_string()))?;

        self.reply(
            Role::QuoteResponse,
            envelope.id.clone(),
            source.to_string(),
            json!({ "model": model, "inputs": inputs, "quote": quote }),
            source,
        )
    }

    fn handle_quote_response(&self, envelope: &Envelope, source: PeerId) -> Result<()> {
        let Some(session) = self.sessions.get(&envelope.id) else {
            tracing::debug!(id = %envelope.id, "bid for unknown session dropped");
            return Ok(());
        };
        if session.side != SessionSide::Customer {
            tracing::debug!(id = %envelope.id, "bid for provider-side session dropped");
            return Ok(());
        }

        let quote = quote_from_payload(envelope.payload.as_ref())?;

        // First bid moves the customer out of discovery.
        if session.phase == SessionPhase::Customer(CustomerState::Discovering) {
            self.sessions
                .advance_customer(&envelope.id, CustomerState::Quoted)?;
        }

        self.auction.add_bid(
            envelope.id.clone(),
            QuoteBid {
                from_peer_id: source.to_string(),
                quote,
            },
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Direct-preferred roles (post-selection exchange)
    // -----------------------------------------------------------------------

    async fn handle_quote_accepted(&self, envelope: &Envelope, source: PeerId) -> Result<()> {
        let Some(session) = self.sessions.get(&envelope.id) else {
            tracing::debug!(id = %envelope.id, "quote-accepted for unknown session dropped");
            return Ok(());
        };
        if session.phase != SessionPhase::Provider(ProviderState::QuoteOffered) {
            tracing::debug!(id = %envelope.id, "duplicate quote-accepted dropped");
            return Ok(());
        }

        let quote = quote_from_payload(envelope.payload.as_ref())?;
        if quote.addr != self.wallet.address().as_str() {
            tracing::debug!(id = %envelope.id, "accepted quote names another provider");
            return Ok(());
        }

        let customer: WalletAddr = envelope.from_wallet_addr.parse()?;
        if let Err(e) = self
            .ledger
            .create_quote(&envelope.id, &customer, quote.usdc_base_units())
            .await
        {
            self.sessions.remove(&envelope.id);
            return Err(e);
        }

        self.sessions
            .advance_provider(&envelope.id, ProviderState::ContractCreatedSent)?;
        self.sessions
            .set_deal(&envelope.id, quote, Some(source.to_string()))?;

        let payload = envelope.payload.clone().unwrap_or(Value::Null);
        self.reply(
            Role::ContractCreated,
            envelope.id.clone(),
            source.to_string(),
            payload,
            source,
        )
    }

    async fn handle_contract_created(&self, envelope: &Envelope, source: PeerId) -> Result<()> {
        let Some(session) = self.sessions.get(&envelope.id) else {
            tracing::debug!(id = %envelope.id, "contract-created for unknown session dropped");
            return Ok(());
        };
        if session.phase != SessionPhase::Customer(CustomerState::Accepted) {
            tracing::debug!(id = %envelope.id, "duplicate contract-created dropped");
            return Ok(());
        }

        // Fund what *we* accepted, not what the payload claims.
        let quote = session.quote.ok_or_else(|| DiiiscoError::SessionError {
            reason: format!("session {} has no accepted quote", envelope.id),
        })?;

        if let Err(e) = self
            .ledger
            .fund_quote(&envelope.id, quote.usdc_base_units())
            .await
        {
            self.sessions.remove(&envelope.id);
            return Err(e);
        }

        self.sessions
            .advance_customer(&envelope.id, CustomerState::ContractSignedSent)?;

        let payload = envelope.payload.clone().unwrap_or(Value::Null);
        self.reply(
            Role::ContractSigned,
            envelope.id.clone(),
            source.to_string(),
            payload,
            source,
        )
    }

    async fn handle_contract_signed(&self, envelope: &Envelope, source: PeerId) -> Result<()> {
        let Some(session) = self.sessions.get(&envelope.id) else {
            tracing::debug!(id = %envelope.id, "contract-signed for unknown session dropped");
            return Ok(());
        };
        if session.phase != SessionPhase::Provider(ProviderState::ContractCreatedSent) {
            tracing::debug!(id = %envelope.id, "duplicate contract-signed dropped");
            return Ok(());
        }

        let quote = session.quote.ok_or_else(|| DiiiscoError::SessionError {
            reason: format!("session {} has no quote", envelope.id),
        })?;

        // The escrow must cover the quoted total before any compute
        // is spent.
        let funding = self.ledger.verify_quote_funded(&envelope.id).await?;
        let required = quote.usdc_base_units();
        if funding.usdc_base_units < required {
            self.sessions.remove(&envelope.id);
            return Err(DiiiscoError::Underfunded {
                funded: funding.usdc_base_units,
                required,
            });
        }

        self.sessions
            .advance_provider(&envelope.id, ProviderState::Inferring)?;

        let inputs: Vec<ChatMessage> = parse_field(session.request.as_ref(), "inputs")?;
        let completion = match self.model.get_response(&quote.model, &inputs).await {
            Ok(completion) => completion,
            Err(e) => {
                self.sessions.remove(&envelope.id);
                return Err(e);
            }
        };

        let mut payload = envelope.payload.clone().unwrap_or_else(|| json!({}));
        if let Some(map) = payload.as_object_mut() {
            map.insert("completion".into(), completion);
        }

        self.sessions
            .advance_provider(&envelope.id, ProviderState::Responded)?;
        let result = self.reply(
            Role::InferenceResponse,
            envelope.id.clone(),
            source.to_string(),
            payload,
            source,
        );
        self.sessions.remove(&envelope.id);
        result
    }

    async fn handle_inference_response(&self, envelope: &Envelope) -> Result<()> {
        let Some(session) = self.sessions.get(&envelope.id) else {
            tracing::debug!(id = %envelope.id, "inference-response for unknown session dropped");
            return Ok(());
        };
        if session.phase != SessionPhase::Customer(CustomerState::ContractSignedSent) {
            tracing::debug!(id = %envelope.id, "duplicate inference-response dropped");
            return Ok(());
        }

        let quote = session.quote.ok_or_else(|| DiiiscoError::SessionError {
            reason: format!("session {} has no accepted quote", envelope.id),
        })?;
        let provider: WalletAddr = quote.addr.parse()?;

        if let Err(e) = self.ledger.complete_quote(&envelope.id, &provider).await {
            self.sessions.remove(&envelope.id);
            return Err(e);
        }

        self.sessions
            .advance_customer(&envelope.id, CustomerState::Paid)?;

        self.bus.complete(
            &inference_response_key(&envelope.id),
            BusEvent::InferenceResponse(envelope.clone()),
        );
        self.bus.complete(
            &session_complete_key(&envelope.id),
            BusEvent::SessionComplete(envelope.id.clone()),
        );

        tracing::info!(id = %envelope.id, provider = %quote.addr, "session paid");
        self.sessions.remove(&envelope.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Logging by rejection class
// ---------------------------------------------------------------------------

/// Logs a processing failure at the level its class deserves.
///
/// Rejections are routine mesh noise (debug); business rejections and
/// session failures are operator-relevant (warn).
pub fn log_processing_error(role: &Role, id: &SessionId, error: &DiiiscoError) {
    match error {
        DiiiscoError::NotAddressedHere
        | DiiiscoError::BadSender { .. }
        | DiiiscoError::Unsigned
        | DiiiscoError::BadSignature
        | DiiiscoError::UnknownRole { .. } => {
            tracing::debug!(%role, %id, %error, "envelope rejected");
        }
        DiiiscoError::NotOptedIn { .. }
        | DiiiscoError::NoQuoteProduced
        | DiiiscoError::ModelNotServed { .. } => {
            tracing::debug!(%role, %id, %error, "request declined");
        }
        _ => {
            tracing::warn!(%role, %id, %error, "message handling failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

fn parse_field<T: serde::de::DeserializeOwned>(
    payload: Option<&Value>,
    key: &str,
) -> Result<T> {
    let value = payload
        .and_then(|p| p.get(key))
        .ok_or_else(|| DiiiscoError::ProtocolError {
            reason: format!("payload missing '{key}'"),
        })?;
    serde_json::from_value(value.clone()).map_err(|e| DiiiscoError::ProtocolError {
        reason: format!("malformed payload field '{key}': {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::quote_selected_key;
    use async_trait::async_trait;
    use diiisco_ledger::InMemoryLedger;
    use diiisco_types::config::SelectionPolicy;
    use std::time::Duration;

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
        async fn get_response(&self, _: &str, _: &[ChatMessage]) -> Result<Value> {
            Ok(json!({ "choices": [{ "message": { "content": "hello" } }] }))
        }
        async fn count_embeddings(&self, _: &str, inputs: &[ChatMessage]) -> Result<u64> {
            Ok(diiisco_model::estimate_tokens(inputs))
        }
    }

    struct Fixture {
        processor: MessageProcessor,
        outbox_rx: mpsc::UnboundedReceiver<OutboundMessage>,
        bus: EventBus,
        wallet: Arc<Wallet>,
    }

    fn fixture(models_enabled: bool) -> Fixture {
        let wallet = Arc::new(Wallet::from_seed(&[0x51; 32]));
        let ledger: Arc<InMemoryLedger> = Arc::new(InMemoryLedger::new());
        let model: Arc<dyn ModelClient> = Arc::new(StaticModel);
        let bus = EventBus::new();
        let sessions = SessionStore::new();
        let auction = QuoteAuction::new(
            Duration::from_millis(20),
            SelectionPolicy::Cheapest,
            ledger.clone(),
            7,
            bus.clone(),
        );
        let pipeline =
            QuotePipeline::from_config(&["embedding-rate".into()], model.clone(), 0.02)
                .unwrap();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        let processor = MessageProcessor::new(
            "12D3KooWLocal".into(),
            wallet.clone(),
            ledger,
            model,
            models_enabled,
            ModelAccumulator::new(Duration::from_millis(20)),
            pipeline,
            auction,
            sessions,
            bus.clone(),
            outbox_tx,
            7,
        );

        Fixture {
            processor,
            outbox_rx,
            bus,
            wallet,
        }
    }

    fn signed(wallet: &Wallet, role: Role, id: &str, to: Option<&str>, payload: Value) -> Envelope {
        let mut envelope = Envelope::new(
            role,
            SessionId::new(id).unwrap(),
            now_millis(),
            wallet.address().as_str(),
            to.map(str::to_string),
            Some(payload),
        );
        sign_envelope(&mut envelope, wallet.signing_key()).unwrap();
        envelope
    }

    #[tokio::test]
    async fn foreign_addressee_dropped() {
        let fx = fixture(true);
        let sender = Wallet::from_seed(&[0x61; 32]);
        let envelope = signed(
            &sender,
            Role::QuoteAccepted,
            "s1",
            Some("12D3KooWSomeoneElse"),
            json!({}),
        );

        let result = fx.processor.process(envelope, PeerId::random()).await;
        assert!(matches!(result, Err(DiiiscoError::NotAddressedHere)));
    }

    #[tokio::test]
    async fn unsigned_envelope_rejected() {
        let fx = fixture(true);
        let sender = Wallet::from_seed(&[0x61; 32]);
        let mut envelope = signed(&sender, Role::QuoteRequest, "s1", None, json!({}));
        envelope.signature = None;

        let result = fx.processor.process(envelope, PeerId::random()).await;
        assert!(matches!(result, Err(DiiiscoError::Unsigned)));
    }

    #[tokio::test]
    async fn unknown_role_rejected_after_verification() {
        let fx = fixture(true);
        let sender = Wallet::from_seed(&[0x61; 32]);
        let envelope = signed(
            &sender,
            Role::Unknown("mystery".into()),
            "s1",
            None,
            json!({}),
        );

        let result = fx.processor.process(envelope, PeerId::random()).await;
        assert!(matches!(result, Err(DiiiscoError::UnknownRole { .. })));
    }

    #[tokio::test]
    async fn quote_request_produces_signed_bid() {
        let mut fx = fixture(true);
        let customer = Wallet::from_seed(&[0x61; 32]);
        let envelope = signed(
            &customer,
            Role::QuoteRequest,
            "s1",
            None,
            json!({
                "model": "gpt-oss:20b",
                "inputs": [{ "role": "user", "content": "hi" }]
            }),
        );

        fx.processor
            .process(envelope, PeerId::random())
            .await
            .unwrap();

        let out = fx.outbox_rx.try_recv().unwrap();
        assert_eq!(out.envelope.role, Role::QuoteResponse);
        assert!(verify_envelope(&out.envelope).is_ok());
        let quote = quote_from_payload(out.envelope.payload.as_ref()).unwrap();
        assert_eq!(quote.addr, fx.wallet.address().as_str());
        assert!(quote.total_price >= 0.0);
    }

    #[tokio::test]
    async fn unserved_model_declined_without_reply() {
        let mut fx = fixture(true);
        let customer = Wallet::from_seed(&[0x61; 32]);
        let envelope = signed(
            &customer,
            Role::QuoteRequest,
            "s1",
            None,
            json!({ "model": "unknown-model", "inputs": [] }),
        );

        let result = fx.processor.process(envelope, PeerId::random()).await;
        assert!(matches!(result, Err(DiiiscoError::ModelNotServed { .. })));
        assert!(fx.outbox_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tampered_bid_never_reaches_auction() {
        let fx = fixture(true);
        let provider = Wallet::from_seed(&[0x61; 32]);

        // Customer session awaiting bids.
        fx.processor
            .sessions
            .insert_customer(SessionId::new("s1").unwrap(), json!({}))
            .unwrap();
        let mut selected = fx
            .bus
            .register(quote_selected_key(&SessionId::new("s1").unwrap()));

        let mut envelope = signed(
            &provider,
            Role::QuoteResponse,
            "s1",
            Some("12D3KooWLocal"),
            json!({ "quote": {
                "model": "gpt-oss:20b",
                "inputCount": 1,
                "tokenCount": 100,
                "pricePerMillion": 0.02,
                "totalPrice": 0.034,
                "addr": provider.address().as_str()
            }}),
        );
        // Lower the price after signing.
        envelope.payload = Some(json!({ "quote": {
            "model": "gpt-oss:20b",
            "inputCount": 1,
            "tokenCount": 100,
            "pricePerMillion": 0.02,
            "totalPrice": 0.017,
            "addr": provider.address().as_str()
        }}));

        let result = fx.processor.process(envelope, PeerId::random()).await;
        assert!(matches!(result, Err(DiiiscoError::BadSignature)));

        // No bid recorded, so no auction window fires.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(selected.try_recv().is_err());
    }
}
