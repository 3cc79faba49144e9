//! Reconciliation state machine (pure, deterministic).
//!
//! All reconciler state lives in [`ReconcilerState`] and changes only through
//! [`ReconcilerState::handle`], which turns one [`Input`] into a list of
//! [`Effect`]s. No IO happens here: the actor in [`crate::reconciler`] runs the
//! effects and feeds provider completions back in as new inputs.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected --Connect--> Connecting --ConnectFinished(Ok)--> Connected
//! Connecting   --ConnectFinished(Err)--> Disconnected   (no retry)
//! Connecting | Connected --Disconnected--> Disconnected --> reconnect (backoff)
//! ```
//!
//! Every connect attempt gets a new epoch. Query completions carry the epoch
//! they were issued under; results from an older epoch are stale and dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use entitle_core::{Entity, ProductId, PurchaseToken};

use crate::backoff::ReconnectPolicy;
use crate::entitlements::Entitlements;
use crate::error::{BillingError, ProviderError, QueryKind};
use crate::events::BillingEventKind;
use crate::model::{BillingResult, ConnectionState, Product, Purchase, ResponseCode};

/// Everything that can happen to the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    // Caller intents.
    Connect,
    RefreshCatalog(Vec<ProductId>),
    RefreshPurchases,
    InitiatePurchase(ProductId),
    Acknowledge(PurchaseToken),
    Resume,

    // Provider notifications.
    /// The service connection dropped. `epoch` names the connection the
    /// notification belongs to; `None` applies to whatever is current.
    Disconnected {
        epoch: Option<u64>,
    },
    PurchasesUpdated {
        result: BillingResult,
        purchases: Vec<Purchase>,
    },

    // Completions of effects.
    ReconnectDue {
        epoch: u64,
    },
    ConnectFinished {
        epoch: u64,
        result: Result<(), ProviderError>,
    },
    CatalogLoaded {
        epoch: u64,
        result: Result<Vec<Product>, ProviderError>,
    },
    PurchasesLoaded {
        epoch: u64,
        result: Result<Vec<Purchase>, ProviderError>,
    },
    PurchaseFlowFinished {
        product_id: ProductId,
        result: Result<(), ProviderError>,
    },
    AcknowledgeFinished {
        token: PurchaseToken,
        result: Result<(), ProviderError>,
    },
}

/// Work the actor must carry out on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartConnection { epoch: u64 },
    ScheduleReconnect { epoch: u64, delay: Duration },
    QueryCatalog { epoch: u64, ids: Vec<ProductId> },
    QueryPurchases { epoch: u64 },
    LaunchPurchaseFlow(Product),
    SendAcknowledgment(PurchaseToken),
    PublishEntitlements(Entitlements),
    Record(BillingEventKind),
}

#[derive(Debug, Clone)]
pub struct ReconcilerState {
    connection: ConnectionState,
    epoch: u64,
    catalog_ids: Vec<ProductId>,
    catalog: Vec<Product>,
    purchases: BTreeMap<PurchaseToken, Purchase>,
    acks_in_flight: BTreeSet<PurchaseToken>,
    entitlements: Entitlements,
    reconnect: ReconnectPolicy,
    consecutive_disconnects: u32,
}

impl ReconcilerState {
    pub fn new(catalog_ids: Vec<ProductId>, reconnect: ReconnectPolicy) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            epoch: 0,
            catalog_ids,
            catalog: Vec::new(),
            purchases: BTreeMap::new(),
            acks_in_flight: BTreeSet::new(),
            entitlements: Entitlements::default(),
            reconnect,
            consecutive_disconnects: 0,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn catalog(&self) -> &[Product] {
        &self.catalog
    }

    pub fn purchases(&self) -> impl Iterator<Item = &Purchase> {
        self.purchases.values()
    }

    pub fn purchase(&self, token: &PurchaseToken) -> Option<&Purchase> {
        self.purchases.get(token)
    }

    pub fn entitlements(&self) -> &Entitlements {
        &self.entitlements
    }

    pub fn is_acknowledging(&self, token: &PurchaseToken) -> bool {
        self.acks_in_flight.contains(token)
    }

    /// Apply one input and return the effects it requires, in order.
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut fx = Vec::new();
        match input {
            Input::Connect => self.connect(&mut fx),
            Input::ReconnectDue { epoch } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "dropping superseded reconnect timer");
                } else if self.connection == ConnectionState::Disconnected {
                    self.connect(&mut fx);
                } else {
                    debug!(state = %self.connection, "reconnect no longer needed");
                }
            }
            Input::ConnectFinished { epoch, result } => self.connect_finished(epoch, result, &mut fx),
            Input::Disconnected { epoch: Some(epoch) } if epoch != self.epoch => {
                debug!(epoch, current = self.epoch, "ignoring disconnect of a replaced connection");
            }
            Input::Disconnected { .. } => self.disconnected(&mut fx),
            Input::RefreshCatalog(ids) => self.refresh_catalog(ids, &mut fx),
            Input::CatalogLoaded { epoch, result } => self.catalog_loaded(epoch, result, &mut fx),
            Input::RefreshPurchases => self.refresh_purchases(&mut fx),
            Input::PurchasesLoaded { epoch, result } => self.purchases_loaded(epoch, result, &mut fx),
            Input::Resume => {
                if self.connection.is_connected() {
                    self.refresh_purchases(&mut fx);
                } else {
                    debug!(state = %self.connection, "resume while not connected; nothing to refresh");
                }
            }
            Input::InitiatePurchase(product_id) => self.initiate_purchase(product_id, &mut fx),
            Input::PurchaseFlowFinished { product_id, result } => match result {
                Ok(()) => {
                    info!(%product_id, "purchase flow launched");
                    fx.push(Effect::Record(BillingEventKind::PurchaseFlowLaunched { product_id }));
                }
                Err(source) => {
                    let error = BillingError::PurchaseFlow { product_id, source };
                    warn!(%error, "failed to launch purchase flow");
                    fx.push(Effect::Record(BillingEventKind::OperationFailed { error }));
                }
            },
            Input::PurchasesUpdated { result, purchases } => {
                self.purchases_updated(result, purchases, &mut fx)
            }
            Input::Acknowledge(token) => self.acknowledge(token, &mut fx),
            Input::AcknowledgeFinished { token, result } => {
                self.acknowledge_finished(token, result, &mut fx)
            }
        }
        fx
    }

    fn set_connection(&mut self, to: ConnectionState, fx: &mut Vec<Effect>) {
        let from = self.connection;
        if from == to {
            return;
        }
        self.connection = to;
        info!(%from, %to, "billing connection state changed");
        fx.push(Effect::Record(BillingEventKind::ConnectionStateChanged { from, to }));
    }

    fn connect(&mut self, fx: &mut Vec<Effect>) {
        if self.connection != ConnectionState::Disconnected {
            debug!(state = %self.connection, "connect ignored; connection already in progress");
            return;
        }
        self.epoch += 1;
        self.set_connection(ConnectionState::Connecting, fx);
        fx.push(Effect::StartConnection { epoch: self.epoch });
    }

    fn connect_finished(&mut self, epoch: u64, result: Result<(), ProviderError>, fx: &mut Vec<Effect>) {
        if epoch != self.epoch || self.connection != ConnectionState::Connecting {
            debug!(epoch, current = self.epoch, "dropping stale connect result");
            return;
        }
        match result {
            Ok(()) => {
                self.set_connection(ConnectionState::Connected, fx);
                let ids = self.catalog_ids.clone();
                self.refresh_catalog(ids, fx);
                self.refresh_purchases(fx);
            }
            Err(source) => {
                self.set_connection(ConnectionState::Disconnected, fx);
                let error = BillingError::Connection(source);
                warn!(%error, "billing setup failed; waiting for caller to reconnect");
                fx.push(Effect::Record(BillingEventKind::OperationFailed { error }));
            }
        }
    }

    fn disconnected(&mut self, fx: &mut Vec<Effect>) {
        if self.connection == ConnectionState::Disconnected {
            debug!("disconnect notification while already disconnected");
            return;
        }

        self.set_connection(ConnectionState::Disconnected, fx);
        self.catalog.clear();
        // Callbacks for these may never arrive; the post-reconnect refresh resends.
        self.acks_in_flight.clear();

        let error = BillingError::UnexpectedDisconnect;
        warn!(%error, "billing service disconnected");
        fx.push(Effect::Record(BillingEventKind::OperationFailed { error }));

        self.consecutive_disconnects = self.consecutive_disconnects.saturating_add(1);
        let attempt = self.consecutive_disconnects;
        let delay = self.reconnect.delay_for_attempt(attempt);
        fx.push(Effect::Record(BillingEventKind::ReconnectScheduled { attempt, delay }));

        if delay.is_zero() {
            self.connect(fx);
        } else {
            info!(attempt, ?delay, "backing off before reconnecting");
            fx.push(Effect::ScheduleReconnect {
                epoch: self.epoch,
                delay,
            });
        }
    }

    fn refresh_catalog(&mut self, ids: Vec<ProductId>, fx: &mut Vec<Effect>) {
        if !self.connection.is_connected() {
            warn!(state = %self.connection, "catalog refresh skipped: not connected");
            return;
        }
        if ids.is_empty() {
            warn!("catalog refresh skipped: no product ids");
            return;
        }
        fx.push(Effect::QueryCatalog {
            epoch: self.epoch,
            ids,
        });
    }

    fn catalog_loaded(
        &mut self,
        epoch: u64,
        result: Result<Vec<Product>, ProviderError>,
        fx: &mut Vec<Effect>,
    ) {
        if !self.is_current(epoch) {
            debug!(epoch, current = self.epoch, "dropping stale catalog result");
            return;
        }
        match result {
            Ok(products) => {
                self.consecutive_disconnects = 0;
                let ids: Vec<ProductId> = products.iter().map(|p| p.id.clone()).collect();
                info!(count = products.len(), "catalog refreshed");
                self.catalog = products;
                fx.push(Effect::Record(BillingEventKind::CatalogRefreshed { products: ids }));
            }
            Err(source) => {
                let error = BillingError::Query {
                    kind: QueryKind::Catalog,
                    source,
                };
                warn!(%error, "keeping previous catalog");
                fx.push(Effect::Record(BillingEventKind::OperationFailed { error }));
            }
        }
    }

    fn refresh_purchases(&mut self, fx: &mut Vec<Effect>) {
        if !self.connection.is_connected() {
            warn!(state = %self.connection, "purchase refresh skipped: not connected");
            return;
        }
        fx.push(Effect::QueryPurchases { epoch: self.epoch });
    }

    fn purchases_loaded(
        &mut self,
        epoch: u64,
        result: Result<Vec<Purchase>, ProviderError>,
        fx: &mut Vec<Effect>,
    ) {
        if !self.is_current(epoch) {
            debug!(epoch, current = self.epoch, "dropping stale purchase list");
            return;
        }
        let owned = match result {
            Ok(owned) => owned,
            Err(source) => {
                let error = BillingError::Query {
                    kind: QueryKind::Purchases,
                    source,
                };
                warn!(%error, "keeping previous purchase cache");
                fx.push(Effect::Record(BillingEventKind::OperationFailed { error }));
                return;
            }
        };

        self.consecutive_disconnects = 0;

        // Merged, never replaced: the list may have been taken before a
        // purchase update or acknowledgment that has already been applied.
        for purchase in owned {
            self.upsert(purchase);
        }

        info!(count = self.purchases.len(), "purchases refreshed");
        fx.push(Effect::Record(BillingEventKind::PurchasesRefreshed {
            count: self.purchases.len(),
        }));

        self.acknowledge_outstanding(fx);
        self.recompute(fx);
    }

    fn initiate_purchase(&mut self, product_id: ProductId, fx: &mut Vec<Effect>) {
        let selection = if !self.connection.is_connected() {
            Err(BillingError::NotConnected {
                operation: "initiate_purchase",
            })
        } else {
            let mut matches = self.catalog.iter().filter(|p| p.id == product_id);
            match (matches.next(), matches.count()) {
                (Some(product), 0) => Ok(product.clone()),
                (Some(_), more) => Err(BillingError::AmbiguousProduct {
                    product_id: product_id.clone(),
                    matches: more + 1,
                }),
                (None, _) => Err(BillingError::UnknownProduct(product_id.clone())),
            }
        };

        match selection {
            Ok(product) => fx.push(Effect::LaunchPurchaseFlow(product)),
            Err(reason) => {
                warn!(%product_id, %reason, "purchase rejected");
                fx.push(Effect::Record(BillingEventKind::PurchaseRejected { product_id, reason }));
            }
        }
    }

    fn purchases_updated(
        &mut self,
        result: BillingResult,
        purchases: Vec<Purchase>,
        fx: &mut Vec<Effect>,
    ) {
        match result.code {
            ResponseCode::Ok => {
                if purchases.is_empty() {
                    debug!("purchase update without purchases");
                    return;
                }
                for purchase in purchases {
                    if !self.catalog.iter().any(|p| p.id == purchase.product_id) {
                        warn!(product_id = %purchase.product_id, token = %purchase.token,
                            "purchase update for a product outside the cached catalog");
                    }
                    self.upsert(purchase);
                }
                if self.connection.is_connected() {
                    self.acknowledge_outstanding(fx);
                } else {
                    info!(state = %self.connection, "deferring acknowledgment until reconnected");
                }
                self.recompute(fx);
            }
            ResponseCode::ItemAlreadyOwned => {
                info!("item already owned; re-deriving purchases from provider");
                self.refresh_purchases(fx);
            }
            ResponseCode::ServiceDisconnected => {
                if self.connection == ConnectionState::Disconnected {
                    self.connect(fx);
                } else {
                    self.disconnected(fx);
                }
            }
            code => {
                let error = BillingError::PurchaseUpdate(ProviderError::from(result));
                if code == ResponseCode::UserCanceled {
                    info!(%error, "purchase canceled by user");
                } else {
                    warn!(%error, "purchase update failed");
                }
                fx.push(Effect::Record(BillingEventKind::OperationFailed { error }));
            }
        }
    }

    fn acknowledge(&mut self, token: PurchaseToken, fx: &mut Vec<Effect>) {
        if self.purchases.get(&token).is_some_and(|p| p.acknowledged) {
            debug!(%token, "purchase already acknowledged");
            return;
        }
        if self.acks_in_flight.contains(&token) {
            debug!(%token, "acknowledgment already in flight");
            return;
        }
        if !self.connection.is_connected() {
            warn!(%token, state = %self.connection, "acknowledgment skipped: not connected");
            return;
        }
        self.acks_in_flight.insert(token.clone());
        fx.push(Effect::SendAcknowledgment(token));
    }

    fn acknowledge_finished(
        &mut self,
        token: PurchaseToken,
        result: Result<(), ProviderError>,
        fx: &mut Vec<Effect>,
    ) {
        self.acks_in_flight.remove(&token);
        match result {
            Ok(()) => {
                info!(%token, "purchase acknowledged");
                fx.push(Effect::Record(BillingEventKind::AcknowledgeSucceeded {
                    token: token.clone(),
                }));
                match self.purchases.get_mut(&token) {
                    Some(purchase) => {
                        purchase.acknowledged = true;
                        self.recompute(fx);
                    }
                    None => {
                        debug!(%token, "acknowledged purchase not cached; refreshing");
                        self.refresh_purchases(fx);
                    }
                }
            }
            Err(source) => {
                let error = BillingError::Acknowledgment { token, source };
                warn!(%error, "purchase left unacknowledged until next reconciliation");
                fx.push(Effect::Record(BillingEventKind::OperationFailed { error }));
            }
        }
    }

    fn acknowledge_outstanding(&mut self, fx: &mut Vec<Effect>) {
        let pending: Vec<PurchaseToken> = self
            .purchases
            .values()
            .filter(|p| p.needs_acknowledgment())
            .map(|p| p.token.clone())
            .collect();
        for token in pending {
            self.acknowledge(token, fx);
        }
    }

    fn upsert(&mut self, mut purchase: Purchase) {
        if let Some(known) = self.purchases.get(purchase.id()) {
            purchase.acknowledged |= known.acknowledged;
        }
        self.purchases.insert(purchase.id().clone(), purchase);
    }

    fn recompute(&mut self, fx: &mut Vec<Effect>) {
        self.entitlements = Entitlements::derive(self.purchases.values());
        fx.push(Effect::PublishEntitlements(self.entitlements.clone()));
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.connection.is_connected()
    }
}
