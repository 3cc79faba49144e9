//! Billing domain module: the entitlement reconciler.
//!
//! Keeps a local entitlement view consistent with an external, asynchronous
//! billing provider. The provider is the source of truth; the reconciler
//! connects, queries the catalog and owned purchases, launches purchase
//! flows, acknowledges completed purchases exactly once and exposes the
//! derived entitlement as a push-based signal.
//!
//! Layout:
//! - [`state`]: pure, deterministic transition function (`Input -> Vec<Effect>`)
//! - [`reconciler`]: tokio actor that owns the state and runs effects
//! - [`provider`]: the SDK boundary plus an in-memory simulation

pub mod backoff;
pub mod config;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod model;
pub mod provider;
pub mod reconciler;
pub mod state;

pub use backoff::ReconnectPolicy;
pub use config::BillingConfig;
pub use entitlements::{EntitlementSignal, Entitlements};
pub use error::{BillingError, ProviderError, QueryKind};
pub use events::{BillingEvent, BillingEventKind};
pub use model::{BillingResult, ConnectionState, Product, Purchase, PurchaseState, ResponseCode};
pub use provider::{BillingProvider, ProviderCall, ProviderListener, SimulatedProvider};
pub use reconciler::{EntitlementReconciler, ReconcilerHandle, ReconcilerSnapshot};
pub use state::{Effect, Input, ReconcilerState};

pub use entitle_core::{ProductId, PurchaseToken};
