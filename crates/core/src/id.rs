//! Strongly-typed identifiers used across the domain.
//!
//! Both identifiers are opaque strings owned by the billing provider. The only
//! local invariant is that they are non-empty (after trimming whitespace).

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a purchasable item in the provider catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductId(String);

/// Identifier of one purchase transaction.
///
/// Stable for the lifetime of a purchase; used as the idempotency key for
/// acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PurchaseToken(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a validated identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id(concat!($name, ": must be non-empty")));
                }
                Ok(Self(value))
            }

            /// Build an identifier from a compile-time constant.
            ///
            /// # Panics
            ///
            /// Panics if `value` is blank.
            pub fn from_static(value: &'static str) -> Self {
                assert!(!value.trim().is_empty(), concat!($name, " must be non-empty"));
                Self(value.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $t {
            type Error = DomainError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_string_newtype!(ProductId, "ProductId");
impl_string_newtype!(PurchaseToken, "PurchaseToken");

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_and_blank_ids_are_rejected() {
        assert!(matches!(ProductId::new(""), Err(DomainError::InvalidId(_))));
        assert!(matches!(PurchaseToken::new("   "), Err(DomainError::InvalidId(_))));
    }

    #[test]
    fn ids_keep_their_original_text() {
        let id: ProductId = "premium_upgrade".parse().unwrap();
        assert_eq!(id.as_str(), "premium_upgrade");
        assert_eq!(id.to_string(), "premium_upgrade");
    }

    #[test]
    fn deserializing_an_empty_token_fails() {
        let err = serde_json::from_str::<PurchaseToken>("\"\"");
        assert!(err.is_err());
    }

    proptest! {
        #[test]
        fn any_non_blank_string_is_a_valid_token(s in "[a-zA-Z0-9._-]{1,64}") {
            let token = PurchaseToken::new(s.clone()).unwrap();
            prop_assert_eq!(token.as_str(), s.as_str());
        }
    }
}
