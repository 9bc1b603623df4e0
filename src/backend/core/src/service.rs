//! Consent service: the wired node.
//!
//! Aggregate factories, command routes and saga subscriptions are built once
//! here from explicit collaborators. Nothing is registered globally.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::aggregates::{
    AggregateFactory, ConsentAggregateFactory, NegotiationAggregateFactory, NegotiationState,
    TreatmentRelationAggregateFactory,
};
use crate::commands::{AggregateRuntime, Command, CommandKind, CommandRouter};
use crate::config::Config;
use crate::consent_store::ConsentStore;
use crate::crypto::CryptoProvider;
use crate::error::Result;
use crate::events::{ConsentData, EventBus, EventEnvelope, EventStore, StreamId};
use crate::facts::ConsentFactBuilder;
use crate::registry::Registry;
use crate::sagas::{
    CheckPartiesSaga, ConsentProgressManager, Saga, SagaHandler, UniquenessProjection, UniquenessSaga,
};
use crate::sync::state::{decode_payload, FullConsentRequestState};
use crate::sync::{BridgeEvent, EventName, EventPublisher, SyncChannel};

/// External collaborators of a node.
#[derive(Clone)]
pub struct Collaborators {
    pub event_store: Arc<dyn EventStore>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub registry: Arc<dyn Registry>,
    pub publisher: Arc<dyn EventPublisher>,
    pub consent_store: Arc<dyn ConsentStore>,
    pub fact_builder: Arc<dyn ConsentFactBuilder>,
    pub uniqueness: Arc<dyn UniquenessProjection>,
}

pub struct ConsentService {
    store: Arc<dyn EventStore>,
    bus: Arc<EventBus>,
    router: Arc<CommandRouter>,
    channel: Arc<SyncChannel>,
    uniqueness: Arc<UniquenessSaga>,
}

impl ConsentService {
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            event_store: store,
            crypto,
            registry,
            publisher,
            consent_store,
            fact_builder,
            uniqueness,
        } = collaborators;

        let bus = Arc::new(EventBus::new());
        let channel = Arc::new(
            SyncChannel::new(
                registry.clone(),
                crypto.clone(),
                publisher,
                fact_builder.clone(),
                consent_store,
            )
            .with_identity(config.node.identity.clone())
            .with_domain(config.consent.domain.clone())
            .with_key_policy(config.sync.key_validity.policy()),
        );

        let factories: [Arc<dyn AggregateFactory>; 3] = [
            Arc::new(ConsentAggregateFactory),
            Arc::new(TreatmentRelationAggregateFactory),
            Arc::new(NegotiationAggregateFactory::new(fact_builder, channel.clone())),
        ];
        let mut router = CommandRouter::new();
        for factory in factories {
            router.register_aggregate(Arc::new(AggregateRuntime::new(
                factory,
                store.clone(),
                bus.clone(),
                config.runtime.clone(),
            )))?;
        }
        let router = Arc::new(router);

        let uniqueness = Arc::new(UniquenessSaga::new(uniqueness));
        let sagas: [Arc<dyn Saga>; 3] = [
            uniqueness.clone(),
            Arc::new(CheckPartiesSaga::new(registry)),
            Arc::new(ConsentProgressManager::new(crypto)),
        ];
        for saga in sagas {
            bus.subscribe(Arc::new(SagaHandler::new(saga, &router)));
        }

        tracing::info!(
            identity = %config.node.identity,
            handlers = bus.handler_count(),
            "Consent service wired"
        );

        Ok(Self {
            store,
            bus,
            router,
            channel,
            uniqueness,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn channel(&self) -> &Arc<SyncChannel> {
        &self.channel
    }

    /// Restore process-local saga state from the event log.
    pub async fn rebuild_projections(&self) -> Result<usize> {
        self.uniqueness.rebuild_from(self.store.as_ref()).await
    }

    pub async fn dispatch(&self, command: Command) -> Result<Vec<EventEnvelope>> {
        self.router.handle(&command).await
    }

    /// Register a new consent request and return its id.
    #[instrument(skip(self, data), fields(consent_id = %data.id))]
    pub async fn register_consent(&self, data: ConsentData) -> Result<Uuid> {
        let id = data.id;
        self.dispatch(Command::register_consent(data).with_correlation(id.to_string()))
            .await?;
        Ok(id)
    }

    /// Process one inbound bridge event.
    #[instrument(skip(self, event), fields(name = %event.name, uuid = %event.uuid))]
    pub async fn handle_bridge_event(&self, event: &BridgeEvent) -> Result<()> {
        match event.name {
            EventName::DistributedRequestReceived => {
                self.channel.handle_distributed_request_received(event).await?;
                self.mirror_signatures(event).await;
            }
            EventName::RequestValid => self.channel.handle_consent_request_valid(event).await?,
            EventName::RequestAcked => self.channel.handle_consent_request_acked(event).await?,
            EventName::ConsentDistributed => {
                if self.channel.handle_consent_distributed(event).await?.is_some() {
                    if let Some(negotiation) = self.local_negotiation(event).await? {
                        self.dispatch(Command::new(negotiation, CommandKind::MarkAllSigned))
                            .await?;
                    }
                }
            }
            EventName::Errored => {
                if let Some(negotiation) = self.local_negotiation(event).await? {
                    let state = NegotiationState::Errored {
                        reason: event.error.clone().unwrap_or_default(),
                    };
                    self.dispatch(Command::new(
                        negotiation,
                        CommandKind::UpdateNegotiationState { state },
                    ))
                    .await?;
                }
            }
            _ => tracing::debug!("Bridge event has no inbound handling"),
        }
        Ok(())
    }

    /// The negotiation named by the event uuid, when it lives on this node.
    async fn local_negotiation(&self, event: &BridgeEvent) -> Result<Option<Uuid>> {
        let Ok(id) = Uuid::parse_str(&event.uuid) else {
            return Ok(None);
        };
        let history = self.store.load(&StreamId::negotiation(id)).await?;
        Ok((!history.is_empty()).then_some(id))
    }

    /// Record the signatures present on the bridge in the local negotiation.
    async fn mirror_signatures(&self, event: &BridgeEvent) {
        let negotiation = match self.local_negotiation(event).await {
            Ok(Some(negotiation)) => negotiation,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load negotiation");
                return;
            }
        };
        let Ok(state) = decode_payload::<FullConsentRequestState>(&event.payload) else {
            return;
        };

        for signature in state.consent_records.iter().flat_map(|r| r.signatures()) {
            let Ok(data) = STANDARD.decode(&signature.signature.data) else {
                continue;
            };
            let command = Command::new(
                negotiation,
                CommandKind::AddSignature {
                    consent_hash: signature.attachment.clone(),
                    party_id: signature.legal_entity.clone(),
                    signature: data,
                },
            );
            if let Err(e) = self.dispatch(command).await {
                tracing::warn!(error = %e, party = %signature.legal_entity, "Could not record signature");
            }
        }
    }
}
