use std::time::Duration;

use chrono::{DateTime, Utc};

use entitle_core::{ProductId, PurchaseToken};
use entitle_events::Event;

use crate::entitlements::Entitlements;
use crate::error::BillingError;
use crate::model::ConnectionState;

/// What the reconciler decided or observed.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEventKind {
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    CatalogRefreshed {
        products: Vec<ProductId>,
    },
    PurchasesRefreshed {
        count: usize,
    },
    PurchaseFlowLaunched {
        product_id: ProductId,
    },
    /// Selection was refused before reaching the provider.
    PurchaseRejected {
        product_id: ProductId,
        reason: BillingError,
    },
    AcknowledgeSucceeded {
        token: PurchaseToken,
    },
    EntitlementsChanged {
        entitled: bool,
        entitlements: Entitlements,
    },
    /// Any non-fatal failure from the error taxonomy.
    OperationFailed {
        error: BillingError,
    },
}

/// Event: a timestamped [`BillingEventKind`].
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub kind: BillingEventKind,
    pub occurred_at: DateTime<Utc>,
}

impl BillingEvent {
    pub fn now(kind: BillingEventKind) -> Self {
        Self {
            kind,
            occurred_at: Utc::now(),
        }
    }
}

impl Event for BillingEvent {
    fn event_type(&self) -> &'static str {
        match &self.kind {
            BillingEventKind::ConnectionStateChanged { .. } => "billing.connection.state_changed",
            BillingEventKind::ReconnectScheduled { .. } => "billing.connection.reconnect_scheduled",
            BillingEventKind::CatalogRefreshed { .. } => "billing.catalog.refreshed",
            BillingEventKind::PurchasesRefreshed { .. } => "billing.purchases.refreshed",
            BillingEventKind::PurchaseFlowLaunched { .. } => "billing.purchase.flow_launched",
            BillingEventKind::PurchaseRejected { .. } => "billing.purchase.rejected",
            BillingEventKind::AcknowledgeSucceeded { .. } => "billing.purchase.acknowledged",
            BillingEventKind::EntitlementsChanged { .. } => "billing.entitlements.changed",
            BillingEventKind::OperationFailed { .. } => "billing.operation.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
