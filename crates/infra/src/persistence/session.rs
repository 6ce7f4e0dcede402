use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use super::error::SessionError;

/// Address of one record inside a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub collection: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl core::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A buffered write, applied by the store when the session is flushed.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Upsert { key: RecordKey, value: JsonValue },
    Delete { key: RecordKey },
}

impl PendingWrite {
    pub fn key(&self) -> &RecordKey {
        match self {
            PendingWrite::Upsert { key, .. } | PendingWrite::Delete { key } => key,
        }
    }
}

/// ORM-agnostic handle to one named data store.
///
/// A session buffers writes (`stage`) and applies them atomically per store
/// when flushed (`persist_changes`). Disposing a session releases it; writes
/// still buffered at that point are discarded.
///
/// Sessions are shared as `Arc<dyn PersistenceSession>` so every repository in
/// one transaction scope can hold the same instance; implementations use
/// interior mutability and must be `Send + Sync`.
///
/// ## Implementation Requirements
///
/// - `load` must observe writes staged on the same session (read-your-writes)
/// - `persist_changes` applies all staged writes or none of them
/// - every operation after `dispose` fails with [`SessionError::Disposed`]
#[async_trait]
pub trait PersistenceSession: Send + Sync {
    /// Name of the store this session is bound to.
    fn store_name(&self) -> &str;

    /// Buffer a write until the next flush.
    fn stage(&self, write: PendingWrite) -> Result<(), SessionError>;

    /// Number of writes buffered since the last flush.
    fn pending_writes(&self) -> usize;

    async fn load(
        &self,
        key: &RecordKey,
        cancel: &CancellationToken,
    ) -> Result<Option<JsonValue>, SessionError>;

    /// Flush buffered writes to the store. Returns the number of writes applied.
    async fn persist_changes(&self, cancel: &CancellationToken) -> Result<usize, SessionError>;

    /// Release the session without flushing.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}
