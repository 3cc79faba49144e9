//! Reconciler configuration.

use std::time::Duration;

use entitle_core::{DomainError, DomainResult, ProductId};

use crate::backoff::ReconnectPolicy;

/// Product queried and sold when nothing else is configured.
pub const DEFAULT_PRODUCT_ID: &str = "premium_upgrade";

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Ids queried by the catalog refresh that follows every successful connect.
    pub catalog_product_ids: Vec<ProductId>,
    /// Product selected by the parameterless "buy" intent.
    pub premium_product_id: ProductId,
    pub reconnect: ReconnectPolicy,
    /// Actor mailbox size.
    pub channel_capacity: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        let product = ProductId::from_static(DEFAULT_PRODUCT_ID);
        Self {
            catalog_product_ids: vec![product.clone()],
            premium_product_id: product,
            reconnect: ReconnectPolicy::default(),
            channel_capacity: 64,
        }
    }
}

impl BillingConfig {
    /// Single-product configuration: the catalog is exactly `product`.
    pub fn for_product(product: ProductId) -> Self {
        Self {
            catalog_product_ids: vec![product.clone()],
            premium_product_id: product,
            ..Self::default()
        }
    }

    pub fn with_catalog(mut self, ids: Vec<ProductId>) -> Self {
        self.catalog_product_ids = ids;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Load from process environment variables.
    ///
    /// | variable | default |
    /// |---|---|
    /// | `ENTITLE_PRODUCT_IDS` (comma separated) | `premium_upgrade` |
    /// | `ENTITLE_PREMIUM_PRODUCT` | first catalog id |
    /// | `ENTITLE_RECONNECT_BASE_MS` | 500 |
    /// | `ENTITLE_RECONNECT_MAX_MS` | 60000 |
    /// | `ENTITLE_CHANNEL_CAPACITY` | 64 |
    pub fn from_env() -> DomainResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`BillingConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DomainResult<Self> {
        let defaults = Self::default();

        let catalog_product_ids = match lookup("ENTITLE_PRODUCT_IDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ProductId::new)
                .collect::<DomainResult<Vec<_>>>()?,
            None => defaults.catalog_product_ids.clone(),
        };

        let premium_product_id = match lookup("ENTITLE_PREMIUM_PRODUCT") {
            Some(raw) => ProductId::new(raw.trim())?,
            None => catalog_product_ids
                .first()
                .cloned()
                .unwrap_or(defaults.premium_product_id.clone()),
        };

        let base_ms = parse_or(&lookup, "ENTITLE_RECONNECT_BASE_MS", 500u64);
        let max_ms = parse_or(&lookup, "ENTITLE_RECONNECT_MAX_MS", 60_000u64);
        let channel_capacity = parse_or(&lookup, "ENTITLE_CHANNEL_CAPACITY", defaults.channel_capacity);

        let config = Self {
            catalog_product_ids,
            premium_product_id,
            reconnect: ReconnectPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            ),
            channel_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.catalog_product_ids.is_empty() {
            return Err(DomainError::validation("catalog product list must not be empty"));
        }
        if !self.catalog_product_ids.contains(&self.premium_product_id) {
            return Err(DomainError::validation(format!(
                "premium product {} is not part of the catalog",
                self.premium_product_id
            )));
        }
        if self.channel_capacity == 0 {
            return Err(DomainError::validation("channel capacity must be positive"));
        }
        Ok(())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: core::str::FromStr + core::fmt::Display + Copy,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, %default, "invalid config value; using default");
            default
        }),
        None => default,
    }
}
