//! Entity trait: identity + continuity across state changes.

use serde::{Deserialize, Serialize};

use crate::value_object::ValueObject;

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Returns the key values that make up the entity's identity.
    ///
    /// Entities with a single surrogate key return a one-element key; entities
    /// identified by a composite key return every component in key order.
    fn key(&self) -> EntityKey;
}

/// Ordered key values identifying one entity instance.
///
/// Rendered as the components joined by `/`, which is also the form used as a
/// record key by repositories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(Vec<String>);

impl EntityKey {
    pub fn single(value: impl ToString) -> Self {
        Self(vec![value.to_string()])
    }

    pub fn composite<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        Self(values.into_iter().map(|v| v.to_string()).collect())
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl core::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl ValueObject for EntityKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_key_renders_components_in_order() {
        let key = EntityKey::composite(["order-7", "line-2"]);
        assert_eq!(key.len(), 2);
        assert_eq!(key.to_string(), "order-7/line-2");
    }

    #[test]
    fn keys_compare_by_value() {
        assert_eq!(EntityKey::single(42), EntityKey::composite([42]));
        assert_ne!(EntityKey::single(42), EntityKey::composite([4, 2]));
    }
}
