//! Billing provider boundary.
//!
//! The provider SDK is an external collaborator: it owns payment handling,
//! receipt validation and the authoritative purchase list. The reconciler only
//! sees the calls below plus two inbound notifications delivered through a
//! [`ProviderListener`].

mod simulated;

pub use simulated::{ProviderCall, SimulatedProvider};

use async_trait::async_trait;
use tokio::sync::mpsc;

use entitle_core::{ProductId, PurchaseToken};

use crate::error::{BillingError, ProviderError};
use crate::model::{BillingResult, Product, Purchase};
use crate::reconciler::Message;
use crate::state::Input;

/// Calls the reconciler issues against the provider.
///
/// Every call runs on its own task, so implementations may take as long as
/// they like; results are fed back into the reconciler's mailbox.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Establish the service connection. `listener` receives purchase updates
    /// and disconnect notifications for as long as the connection lives.
    async fn start_connection(&self, listener: ProviderListener) -> Result<(), ProviderError>;

    async fn query_products(&self, ids: &[ProductId]) -> Result<Vec<Product>, ProviderError>;

    /// Purchases currently recorded as owned by the user.
    async fn query_purchases(&self) -> Result<Vec<Purchase>, ProviderError>;

    /// Hand off to the provider's purchase UI. The outcome arrives later via
    /// [`ProviderListener::purchases_updated`], never as this call's result.
    async fn launch_purchase_flow(&self, product: &Product) -> Result<(), ProviderError>;

    async fn acknowledge(&self, token: &PurchaseToken) -> Result<(), ProviderError>;
}

/// Inbound notification channel from the provider to the reconciler.
///
/// Cloneable and usable from any task; deliveries are serialized through the
/// reconciler's mailbox. A listener does not keep the reconciler alive: once
/// every [`ReconcilerHandle`](crate::ReconcilerHandle) is gone, deliveries
/// fail with [`BillingError::ReconcilerClosed`].
#[derive(Debug, Clone)]
pub struct ProviderListener {
    mailbox: mpsc::WeakSender<Message>,
    /// Connection this listener was registered for.
    epoch: Option<u64>,
}

impl ProviderListener {
    pub(crate) fn new(mailbox: mpsc::WeakSender<Message>, epoch: Option<u64>) -> Self {
        Self { mailbox, epoch }
    }

    /// Purchase-flow outcome or an out-of-band purchase change.
    pub async fn purchases_updated(
        &self,
        result: BillingResult,
        purchases: Vec<Purchase>,
    ) -> Result<(), BillingError> {
        self.deliver(Input::PurchasesUpdated { result, purchases }).await
    }

    /// The service connection dropped. Ignored if the reconciler has since
    /// moved on to a newer connection.
    pub async fn service_disconnected(&self) -> Result<(), BillingError> {
        self.deliver(Input::Disconnected { epoch: self.epoch }).await
    }

    async fn deliver(&self, input: Input) -> Result<(), BillingError> {
        let sender = self.mailbox.upgrade().ok_or(BillingError::ReconcilerClosed)?;
        sender
            .send(Message::Input(input))
            .await
            .map_err(|_| BillingError::ReconcilerClosed)
    }
}
