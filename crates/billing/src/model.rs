use serde::{Deserialize, Serialize};

use entitle_core::{Entity, ProductId, PurchaseToken};

/// Response codes reported by the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCode {
    Ok,
    UserCanceled,
    ServiceUnavailable,
    BillingUnavailable,
    ItemUnavailable,
    DeveloperError,
    Error,
    ItemAlreadyOwned,
    ItemNotOwned,
    ServiceDisconnected,
    FeatureNotSupported,
    ServiceTimeout,
}

impl ResponseCode {
    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseCode::Ok => "ok",
            ResponseCode::UserCanceled => "user_canceled",
            ResponseCode::ServiceUnavailable => "service_unavailable",
            ResponseCode::BillingUnavailable => "billing_unavailable",
            ResponseCode::ItemUnavailable => "item_unavailable",
            ResponseCode::DeveloperError => "developer_error",
            ResponseCode::Error => "error",
            ResponseCode::ItemAlreadyOwned => "item_already_owned",
            ResponseCode::ItemNotOwned => "item_not_owned",
            ResponseCode::ServiceDisconnected => "service_disconnected",
            ResponseCode::FeatureNotSupported => "feature_not_supported",
            ResponseCode::ServiceTimeout => "service_timeout",
        }
    }
}

impl core::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome attached to a provider notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingResult {
    pub code: ResponseCode,
    pub debug_message: String,
}

impl BillingResult {
    pub fn new(code: ResponseCode, debug_message: impl Into<String>) -> Self {
        Self {
            code,
            debug_message: debug_message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(ResponseCode::Ok, "")
    }
}

/// A purchasable item as returned by a catalog query.
///
/// Immutable; the whole catalog is replaced on every successful query and
/// discarded when the connection drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    /// Provider-formatted pricing, opaque to the reconciler.
    pub price_info: String,
}

impl Product {
    pub fn new(id: ProductId, price_info: impl Into<String>) -> Self {
        Self {
            id,
            price_info: price_info.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseState {
    Pending,
    Purchased,
    Cancelled,
}

/// One purchase transaction as recorded by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub token: PurchaseToken,
    pub product_id: ProductId,
    pub state: PurchaseState,
    pub acknowledged: bool,
}

impl Purchase {
    pub fn new(token: PurchaseToken, product_id: ProductId, state: PurchaseState) -> Self {
        Self {
            token,
            product_id,
            state,
            acknowledged: false,
        }
    }

    pub fn acknowledged(mut self) -> Self {
        self.acknowledged = true;
        self
    }

    /// Completed but not yet confirmed to the provider.
    ///
    /// Pending purchases are never acknowledged; they wait until the provider
    /// reports them as purchased.
    pub fn needs_acknowledgment(&self) -> bool {
        self.state == PurchaseState::Purchased && !self.acknowledged
    }

    pub fn grants_entitlement(&self) -> bool {
        self.state == PurchaseState::Purchased && self.acknowledged
    }
}

impl Entity for Purchase {
    type Id = PurchaseToken;

    fn id(&self) -> &Self::Id {
        &self.token
    }
}

/// Connection lifecycle to the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl core::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}
