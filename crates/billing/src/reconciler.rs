//! Entitlement reconciler actor.
//!
//! A single tokio task owns the [`ReconcilerState`] and drains a bounded
//! mailbox. Caller intents, provider notifications and provider-call
//! completions all arrive as messages, so every state mutation is serialized
//! through one place regardless of which thread produced it.
//!
//! Provider calls are never awaited by the actor itself: each one runs on its
//! own task and reports back through the mailbox. Nothing the handle exposes
//! waits for the provider.
//!
//! Only handles and in-flight provider calls hold the mailbox open. Provider
//! listeners and backoff timers hold it weakly, so the actor stops once the
//! last handle is dropped even if the provider keeps its listener.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use entitle_core::{ProductId, PurchaseToken};
use entitle_events::{EventBus, EventEnvelope};

use crate::config::BillingConfig;
use crate::entitlements::{EntitlementSignal, Entitlements};
use crate::error::BillingError;
use crate::events::{BillingEvent, BillingEventKind};
use crate::model::{ConnectionState, Product, Purchase};
use crate::provider::{BillingProvider, ProviderListener};
use crate::state::{Effect, Input, ReconcilerState};

/// Mailbox message.
#[derive(Debug)]
pub(crate) enum Message {
    Input(Input),
    Snapshot(oneshot::Sender<ReconcilerSnapshot>),
    Shutdown,
}

/// Point-in-time copy of the reconciler's caches.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerSnapshot {
    pub connection: ConnectionState,
    pub catalog: Vec<Product>,
    pub purchases: Vec<Purchase>,
    pub entitlements: Entitlements,
}

/// Spawns the reconciler actor.
pub struct EntitlementReconciler;

impl EntitlementReconciler {
    /// Start the actor on the current tokio runtime.
    ///
    /// The reconciler starts disconnected; call [`ReconcilerHandle::connect`]
    /// to begin. Transitions are published on `bus`.
    pub fn spawn<B>(provider: Arc<dyn BillingProvider>, bus: B, config: BillingConfig) -> ReconcilerHandle
    where
        B: EventBus<EventEnvelope<BillingEvent>> + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let (entitlements_tx, entitlements_rx) = watch::channel(Entitlements::default());
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = Actor {
            state: ReconcilerState::new(config.catalog_product_ids.clone(), config.reconnect),
            provider,
            bus,
            mailbox: sender.downgrade(),
            entitlements: entitlements_tx,
            connection: connection_tx,
            sequence: 0,
        };
        let task = tokio::spawn(actor.run(receiver));

        ReconcilerHandle {
            sender,
            entitlements: entitlements_rx,
            connection: connection_rx,
            config: Arc::new(config),
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }
}

/// Cloneable front door to a running reconciler.
///
/// Every method returns as soon as the request is queued; outcomes show up
/// in the entitlement signal, the connection watch and the event bus.
#[derive(Debug, Clone)]
pub struct ReconcilerHandle {
    sender: mpsc::Sender<Message>,
    entitlements: watch::Receiver<Entitlements>,
    connection: watch::Receiver<ConnectionState>,
    config: Arc<BillingConfig>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl ReconcilerHandle {
    pub async fn connect(&self) -> Result<(), BillingError> {
        self.send(Input::Connect).await
    }

    pub async fn refresh_catalog(&self, ids: Vec<ProductId>) -> Result<(), BillingError> {
        self.send(Input::RefreshCatalog(ids)).await
    }

    pub async fn refresh_purchases(&self) -> Result<(), BillingError> {
        self.send(Input::RefreshPurchases).await
    }

    pub async fn initiate_purchase(&self, product_id: ProductId) -> Result<(), BillingError> {
        self.send(Input::InitiatePurchase(product_id)).await
    }

    /// The parameterless "buy" intent: purchase the configured premium product.
    pub async fn buy(&self) -> Result<(), BillingError> {
        self.initiate_purchase(self.config.premium_product_id.clone())
            .await
    }

    pub async fn acknowledge(&self, token: PurchaseToken) -> Result<(), BillingError> {
        self.send(Input::Acknowledge(token)).await
    }

    /// Host came back to the foreground: re-check owned purchases if connected.
    pub async fn on_resume(&self) -> Result<(), BillingError> {
        self.send(Input::Resume).await
    }

    /// Notification channel to hand to provider implementations.
    ///
    /// Not tied to a particular connection: a disconnect reported through it
    /// always applies to the current one.
    pub fn listener(&self) -> ProviderListener {
        ProviderListener::new(self.sender.downgrade(), None)
    }

    pub fn subscribe(&self) -> EntitlementSignal {
        EntitlementSignal::new(self.entitlements.clone())
    }

    pub fn is_entitled(&self) -> bool {
        self.entitlements.borrow().is_entitled()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Copy of the caches after every message queued before this call.
    pub async fn snapshot(&self) -> Result<ReconcilerSnapshot, BillingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Message::Snapshot(tx))
            .await
            .map_err(|_| BillingError::ReconcilerClosed)?;
        rx.await.map_err(|_| BillingError::ReconcilerClosed)
    }

    /// Stop the actor and wait for it to exit. In-flight provider calls are
    /// abandoned; their completions are discarded.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(Message::Shutdown).await;
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "reconciler task ended abnormally");
            }
        }
    }

    async fn send(&self, input: Input) -> Result<(), BillingError> {
        self.sender
            .send(Message::Input(input))
            .await
            .map_err(|_| BillingError::ReconcilerClosed)
    }
}

struct Actor<B> {
    state: ReconcilerState,
    provider: Arc<dyn BillingProvider>,
    bus: B,
    mailbox: mpsc::WeakSender<Message>,
    entitlements: watch::Sender<Entitlements>,
    connection: watch::Sender<ConnectionState>,
    sequence: u64,
}

impl<B> Actor<B>
where
    B: EventBus<EventEnvelope<BillingEvent>> + 'static,
{
    async fn run(mut self, mut receiver: mpsc::Receiver<Message>) {
        info!("entitlement reconciler started");

        while let Some(message) = receiver.recv().await {
            match message {
                Message::Input(input) => {
                    let effects = self.state.handle(input);
                    for effect in effects {
                        self.execute(effect);
                    }
                }
                Message::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Message::Shutdown => break,
            }
        }

        info!("entitlement reconciler stopped");
    }

    fn snapshot(&self) -> ReconcilerSnapshot {
        ReconcilerSnapshot {
            connection: self.state.connection(),
            catalog: self.state.catalog().to_vec(),
            purchases: self.state.purchases().cloned().collect(),
            entitlements: self.state.entitlements().clone(),
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::StartConnection { epoch } => {
                let listener = ProviderListener::new(self.mailbox.clone(), Some(epoch));
                self.spawn_call(move |provider| async move {
                    let result = provider.start_connection(listener).await;
                    Input::ConnectFinished { epoch, result }
                });
            }
            Effect::ScheduleReconnect { epoch, delay } => {
                let mailbox = self.mailbox.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(sender) = mailbox.upgrade() {
                        let _ = sender.send(Message::Input(Input::ReconnectDue { epoch })).await;
                    }
                });
            }
            Effect::QueryCatalog { epoch, ids } => self.spawn_call(move |provider| async move {
                let result = provider.query_products(&ids).await;
                Input::CatalogLoaded { epoch, result }
            }),
            Effect::QueryPurchases { epoch } => self.spawn_call(move |provider| async move {
                let result = provider.query_purchases().await;
                Input::PurchasesLoaded { epoch, result }
            }),
            Effect::LaunchPurchaseFlow(product) => self.spawn_call(move |provider| async move {
                let result = provider.launch_purchase_flow(&product).await;
                Input::PurchaseFlowFinished {
                    product_id: product.id,
                    result,
                }
            }),
            Effect::SendAcknowledgment(token) => self.spawn_call(move |provider| async move {
                let result = provider.acknowledge(&token).await;
                Input::AcknowledgeFinished { token, result }
            }),
            Effect::PublishEntitlements(entitlements) => {
                self.entitlements.send_replace(entitlements.clone());
                self.publish(BillingEventKind::EntitlementsChanged {
                    entitled: entitlements.is_entitled(),
                    entitlements,
                });
            }
            Effect::Record(kind) => {
                if let BillingEventKind::ConnectionStateChanged { to, .. } = &kind {
                    self.connection.send_replace(*to);
                }
                self.publish(kind);
            }
        }
    }

    fn spawn_call<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn BillingProvider>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Input> + Send + 'static,
    {
        let Some(sender) = self.mailbox.upgrade() else {
            debug!("mailbox closed; provider call skipped");
            return;
        };
        let provider = Arc::clone(&self.provider);
        tokio::spawn(async move {
            let completion = call(provider).await;
            if sender.send(Message::Input(completion)).await.is_err() {
                debug!("reconciler stopped before provider call completed");
            }
        });
    }

    fn publish(&mut self, kind: BillingEventKind) {
        self.sequence += 1;
        let envelope = EventEnvelope::wrap(self.sequence, BillingEvent::now(kind));
        if let Err(err) = self.bus.publish(envelope) {
            warn!(error = ?err, "failed to publish billing event");
        }
    }
}
