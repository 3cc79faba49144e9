//! Billing error taxonomy.
//!
//! None of these are fatal. The reconciler logs them and publishes them as
//! events; callers never have to handle them synchronously, except
//! [`BillingError::ReconcilerClosed`] when the actor is gone.

use thiserror::Error;

use entitle_core::{ProductId, PurchaseToken};

use crate::model::{BillingResult, ResponseCode};

/// Failure reported by the billing provider for a single call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ResponseCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<BillingResult> for ProviderError {
    fn from(result: BillingResult) -> Self {
        Self::new(result.code, result.debug_message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Catalog,
    Purchases,
}

impl core::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            QueryKind::Catalog => f.write_str("catalog"),
            QueryKind::Purchases => f.write_str("purchases"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// Provider unreachable or misconfigured.
    #[error("connection to billing provider failed: {0}")]
    Connection(#[source] ProviderError),

    #[error("{kind} query failed: {source}")]
    Query {
        kind: QueryKind,
        #[source]
        source: ProviderError,
    },

    #[error("purchase flow for {product_id} failed to launch: {source}")]
    PurchaseFlow {
        product_id: ProductId,
        #[source]
        source: ProviderError,
    },

    /// The purchase stays unacknowledged until the next reconciliation.
    #[error("acknowledgment of {token} failed: {source}")]
    Acknowledgment {
        token: PurchaseToken,
        #[source]
        source: ProviderError,
    },

    /// A purchase notification carried a non-success outcome.
    #[error("purchase update reported {0}")]
    PurchaseUpdate(#[source] ProviderError),

    #[error("billing provider disconnected unexpectedly")]
    UnexpectedDisconnect,

    #[error("{operation} requires a connected billing provider")]
    NotConnected { operation: &'static str },

    #[error("product {0} is not in the cached catalog")]
    UnknownProduct(ProductId),

    #[error("product {product_id} matches {matches} cached catalog entries")]
    AmbiguousProduct { product_id: ProductId, matches: usize },

    #[error("entitlement reconciler is no longer running")]
    ReconcilerClosed,
}
