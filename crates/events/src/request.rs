//! Requests: commands (intent to change state) and queries (reads).
//!
//! Requests are plain data identified by their concrete type. They carry no
//! behavior; the dispatcher routes them to the handler registered for the
//! type.
//!
//! ## Command vs Event
//!
//! - **Command**: Intent to do something (e.g., "Place order 42")
//! - **Event**: Fact that something happened (e.g., "OrderPlaced { id: 42 }")
//!
//! Commands are rejected if invalid (validation errors). Events represent
//! accepted changes.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A request that mutates state and yields a result object.
///
/// Commands must be:
/// - **Send + Sync**: Commands cross task boundaries
/// - **'static**: Commands own all their data
pub trait Command: core::fmt::Debug + Send + Sync + 'static {}

/// A request that reads state and yields a projection.
///
/// Queries are serializable so a deterministic cache key can be derived from
/// their content when they opt into caching.
pub trait Query: core::fmt::Debug + Serialize + Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Declare whether (and how) results of this query may be memoized.
    ///
    /// Defaults to no caching.
    fn cache_policy(&self) -> Option<CachePolicy> {
        None
    }
}

/// Per-query caching declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Explicit cache key; when absent the key is derived from the query
    /// type name and its serialized content.
    pub key: Option<String>,
    /// Advisory time-to-live passed to the cache backend.
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
