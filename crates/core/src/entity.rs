//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// A purchase is the canonical entity of this domain: its token stays stable
/// while its acknowledgment flag changes.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
