//! Derived entitlement view and its push-based signal.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::watch;

use entitle_core::ProductId;

use crate::error::BillingError;
use crate::model::Purchase;

/// Per-product entitlement, derived from the purchase cache.
///
/// Never mutated independently: it is recomputed from purchases every time
/// they change. A product is entitled iff at least one of its purchases is
/// purchased and acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Entitlements {
    products: BTreeMap<ProductId, bool>,
}

impl Entitlements {
    pub fn derive<'a>(purchases: impl IntoIterator<Item = &'a Purchase>) -> Self {
        let mut products = BTreeMap::new();
        for purchase in purchases {
            let entitled = products.entry(purchase.product_id.clone()).or_insert(false);
            *entitled |= purchase.grants_entitlement();
        }
        Self { products }
    }

    /// Single-boolean view: entitled to anything at all.
    pub fn is_entitled(&self) -> bool {
        self.products.values().any(|entitled| *entitled)
    }

    pub fn is_entitled_to(&self, product_id: &ProductId) -> bool {
        self.products.get(product_id).copied().unwrap_or(false)
    }

    pub fn entitled_products(&self) -> impl Iterator<Item = &ProductId> {
        self.products
            .iter()
            .filter(|(_, entitled)| **entitled)
            .map(|(id, _)| id)
    }
}

/// Read-only observer of the entitlement view.
///
/// Starts out not entitled. Every recomputation is pushed, so `changed()`
/// wakes even when the value is unchanged. Clone freely; each clone tracks
/// its own "seen" position.
#[derive(Debug, Clone)]
pub struct EntitlementSignal {
    receiver: watch::Receiver<Entitlements>,
}

impl EntitlementSignal {
    pub(crate) fn new(receiver: watch::Receiver<Entitlements>) -> Self {
        Self { receiver }
    }

    pub fn current(&self) -> Entitlements {
        self.receiver.borrow().clone()
    }

    pub fn is_entitled(&self) -> bool {
        self.receiver.borrow().is_entitled()
    }

    pub fn is_entitled_to(&self, product_id: &ProductId) -> bool {
        self.receiver.borrow().is_entitled_to(product_id)
    }

    /// Wait for the next push and return the single-boolean view.
    pub async fn changed(&mut self) -> Result<bool, BillingError> {
        self.receiver
            .changed()
            .await
            .map_err(|_| BillingError::ReconcilerClosed)?;
        Ok(self.receiver.borrow_and_update().is_entitled())
    }

    /// Resolve once the view satisfies `predicate` (checks the current value first).
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&Entitlements) -> bool,
    ) -> Result<Entitlements, BillingError> {
        let value = self
            .receiver
            .wait_for(|e| predicate(e))
            .await
            .map_err(|_| BillingError::ReconcilerClosed)?;
        Ok(value.clone())
    }
}
