//! In-memory billing provider for tests and console hosts.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use entitle_core::{ProductId, PurchaseToken};

use super::{BillingProvider, ProviderListener};
use crate::error::ProviderError;
use crate::model::{BillingResult, Product, Purchase, PurchaseState, ResponseCode};

/// A provider call, as recorded by [`SimulatedProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    StartConnection,
    QueryProducts(Vec<ProductId>),
    QueryPurchases,
    LaunchPurchaseFlow(ProductId),
    Acknowledge(PurchaseToken),
}

#[derive(Debug, Default)]
struct SimState {
    catalog: Vec<Product>,
    owned: Vec<Purchase>,
    listener: Option<ProviderListener>,
    calls: Vec<ProviderCall>,
    connect_failures: VecDeque<ProviderError>,
    catalog_failures: VecDeque<ProviderError>,
    purchase_query_failures: VecDeque<ProviderError>,
    launch_failures: VecDeque<ProviderError>,
    acknowledge_failures: VecDeque<ProviderError>,
    complete_launched_flows: bool,
    next_token: u64,
}

/// Scripted provider with an in-memory store of owned purchases.
///
/// - Every call is recorded (see [`SimulatedProvider::calls`]).
/// - Failures are queued per call kind with the `fail_next_*` methods and
///   consumed one per call.
/// - With [`SimulatedProvider::completing_purchases`], a launched purchase
///   flow completes on its own: a new unacknowledged purchase is recorded and
///   reported through the listener from a separate task.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    state: Mutex<SimState>,
}

impl SimulatedProvider {
    pub fn new(catalog: Vec<Product>) -> Self {
        Self {
            state: Mutex::new(SimState {
                catalog,
                ..SimState::default()
            }),
        }
    }

    pub fn completing_purchases(self) -> Self {
        self.lock().complete_launched_flows = true;
        self
    }

    pub fn with_owned(self, purchase: Purchase) -> Self {
        self.lock().owned.push(purchase);
        self
    }

    pub fn fail_next_connect(&self, error: ProviderError) {
        self.lock().connect_failures.push_back(error);
    }

    pub fn fail_next_catalog_query(&self, error: ProviderError) {
        self.lock().catalog_failures.push_back(error);
    }

    pub fn fail_next_purchase_query(&self, error: ProviderError) {
        self.lock().purchase_query_failures.push_back(error);
    }

    pub fn fail_next_launch(&self, error: ProviderError) {
        self.lock().launch_failures.push_back(error);
    }

    pub fn fail_next_acknowledge(&self, error: ProviderError) {
        self.lock().acknowledge_failures.push_back(error);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&ProviderCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn acknowledge_count(&self, token: &PurchaseToken) -> usize {
        self.count_calls(|c| matches!(c, ProviderCall::Acknowledge(t) if t == token))
    }

    pub fn owned(&self) -> Vec<Purchase> {
        self.lock().owned.clone()
    }

    /// Record a completed purchase as the store would and return it.
    pub fn record_purchase(&self, product_id: ProductId) -> Purchase {
        let mut state = self.lock();
        state.next_token += 1;
        let token = PurchaseToken::new(format!("sim-{}", state.next_token))
            .unwrap_or_else(|_| unreachable!("generated tokens are never blank"));
        let purchase = Purchase::new(token, product_id, PurchaseState::Purchased);
        state.owned.push(purchase.clone());
        purchase
    }

    /// Deliver a purchase notification through the registered listener.
    ///
    /// Returns `false` when no connection has registered a listener yet or the
    /// reconciler is gone.
    pub async fn notify(&self, result: BillingResult, purchases: Vec<Purchase>) -> bool {
        let Some(listener) = self.listener() else {
            return false;
        };
        listener.purchases_updated(result, purchases).await.is_ok()
    }

    /// Drop the service connection, as the platform would.
    pub async fn disconnect(&self) -> bool {
        let Some(listener) = self.listener() else {
            return false;
        };
        listener.service_disconnected().await.is_ok()
    }

    fn listener(&self) -> Option<ProviderListener> {
        self.lock().listener.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BillingProvider for SimulatedProvider {
    async fn start_connection(&self, listener: ProviderListener) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::StartConnection);
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        state.listener = Some(listener);
        Ok(())
    }

    async fn query_products(&self, ids: &[ProductId]) -> Result<Vec<Product>, ProviderError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::QueryProducts(ids.to_vec()));
        if let Some(err) = state.catalog_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .catalog
            .iter()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect())
    }

    async fn query_purchases(&self) -> Result<Vec<Purchase>, ProviderError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::QueryPurchases);
        if let Some(err) = state.purchase_query_failures.pop_front() {
            return Err(err);
        }
        Ok(state.owned.clone())
    }

    async fn launch_purchase_flow(&self, product: &Product) -> Result<(), ProviderError> {
        let (complete, listener) = {
            let mut state = self.lock();
            state
                .calls
                .push(ProviderCall::LaunchPurchaseFlow(product.id.clone()));
            if let Some(err) = state.launch_failures.pop_front() {
                return Err(err);
            }
            if state.owned.iter().any(|p| p.product_id == product.id) {
                // Non-consumable: a second purchase of the same item is refused.
                let listener = state.listener.clone();
                drop(state);
                if let Some(listener) = listener {
                    tokio::spawn(async move {
                        let result =
                            BillingResult::new(ResponseCode::ItemAlreadyOwned, "item already owned");
                        let _ = listener.purchases_updated(result, Vec::new()).await;
                    });
                }
                return Ok(());
            }
            (state.complete_launched_flows, state.listener.clone())
        };

        if complete {
            let purchase = self.record_purchase(product.id.clone());
            if let Some(listener) = listener {
                tokio::spawn(async move {
                    let _ = listener
                        .purchases_updated(BillingResult::ok(), vec![purchase])
                        .await;
                });
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, token: &PurchaseToken) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::Acknowledge(token.clone()));
        if let Some(err) = state.acknowledge_failures.pop_front() {
            return Err(err);
        }
        match state.owned.iter_mut().find(|p| &p.token == token) {
            Some(purchase) => {
                purchase.acknowledged = true;
                Ok(())
            }
            None => Err(ProviderError::new(
                ResponseCode::ItemNotOwned,
                format!("unknown purchase token {token}"),
            )),
        }
    }
}
