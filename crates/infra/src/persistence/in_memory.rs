use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use super::error::SessionError;
use super::factory::SessionFactory;
use super::session::{PendingWrite, PersistenceSession, RecordKey};

/// In-memory record store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    records: RwLock<HashMap<RecordKey, JsonValue>>,
    commits: AtomicUsize,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RecordKey) -> Option<JsonValue> {
        self.records.read().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of non-empty batches committed.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Apply a batch atomically (single write lock).
    fn commit(&self, writes: Vec<PendingWrite>) -> Result<usize, SessionError> {
        if writes.is_empty() {
            return Ok(0);
        }

        let mut records = self
            .records
            .write()
            .map_err(|_| SessionError::Backend(anyhow::anyhow!("lock poisoned")))?;

        let applied = writes.len();
        for write in writes {
            match write {
                PendingWrite::Upsert { key, value } => {
                    records.insert(key, value);
                }
                PendingWrite::Delete { key } => {
                    records.remove(&key);
                }
            }
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(applied)
    }
}

/// Session over an [`InMemoryDataStore`].
#[derive(Debug)]
pub struct InMemorySession {
    store_name: String,
    store: Arc<InMemoryDataStore>,
    pending: Mutex<Vec<PendingWrite>>,
    flushes: AtomicUsize,
    disposed: AtomicBool,
}

impl InMemorySession {
    pub fn new(store_name: impl Into<String>, store: Arc<InMemoryDataStore>) -> Self {
        Self {
            store_name: store_name.into(),
            store,
            pending: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Number of `persist_changes` calls that succeeded.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(SessionError::Disposed)
        } else {
            Ok(())
        }
    }

    fn pending(&self) -> Result<std::sync::MutexGuard<'_, Vec<PendingWrite>>, SessionError> {
        self.pending
            .lock()
            .map_err(|_| SessionError::Backend(anyhow::anyhow!("lock poisoned")))
    }
}

#[async_trait]
impl PersistenceSession for InMemorySession {
    fn store_name(&self) -> &str {
        &self.store_name
    }

    fn stage(&self, write: PendingWrite) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.pending()?.push(write);
        Ok(())
    }

    fn pending_writes(&self) -> usize {
        self.pending().map(|p| p.len()).unwrap_or(0)
    }

    async fn load(
        &self,
        key: &RecordKey,
        cancel: &CancellationToken,
    ) -> Result<Option<JsonValue>, SessionError> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        // Latest staged write wins over the committed record.
        let staged = self
            .pending()?
            .iter()
            .rev()
            .find(|w| w.key() == key)
            .cloned();
        match staged {
            Some(PendingWrite::Upsert { value, .. }) => Ok(Some(value)),
            Some(PendingWrite::Delete { .. }) => Ok(None),
            None => Ok(self.store.get(key)),
        }
    }

    async fn persist_changes(&self, cancel: &CancellationToken) -> Result<usize, SessionError> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let writes = std::mem::take(&mut *self.pending()?);
        let applied = self.store.commit(writes)?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(applied)
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            if let Ok(mut pending) = self.pending.lock() {
                pending.clear();
            }
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Sessions an [`InMemorySessionFactory`] keeps for inspection.
pub const RECENT_SESSIONS: usize = 16;

/// Factory handing out [`InMemorySession`]s over one shared store.
///
/// Keeps the last [`RECENT_SESSIONS`] sessions it opened so tests can inspect
/// flush counts and disposal.
#[derive(Debug, Default)]
pub struct InMemorySessionFactory {
    store: Arc<InMemoryDataStore>,
    opened: Mutex<VecDeque<Arc<InMemorySession>>>,
}

impl InMemorySessionFactory {
    pub fn new(store: Arc<InMemoryDataStore>) -> Self {
        Self {
            store,
            opened: Mutex::new(VecDeque::with_capacity(RECENT_SESSIONS)),
        }
    }

    pub fn store(&self) -> &Arc<InMemoryDataStore> {
        &self.store
    }

    /// Most recently opened sessions, oldest first.
    pub fn opened_sessions(&self) -> Vec<Arc<InMemorySession>> {
        self.opened
            .lock()
            .map(|o| o.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionFactory for InMemorySessionFactory {
    async fn open(
        &self,
        store: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn PersistenceSession>, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let session = Arc::new(InMemorySession::new(store, self.store.clone()));
        if let Ok(mut opened) = self.opened.lock() {
            if opened.len() == RECENT_SESSIONS {
                opened.pop_front();
            }
            opened.push_back(session.clone());
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(id: &str) -> RecordKey {
        RecordKey::new("orders", id)
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_to_the_store_until_flushed() {
        let store = Arc::new(InMemoryDataStore::new());
        let session = InMemorySession::new("Orders", store.clone());
        let cancel = CancellationToken::new();

        session
            .stage(PendingWrite::Upsert {
                key: key("1"),
                value: json!({"total": 10}),
            })
            .unwrap();

        assert_eq!(session.load(&key("1"), &cancel).await.unwrap(), Some(json!({"total": 10})));
        assert!(store.get(&key("1")).is_none());

        assert_eq!(session.persist_changes(&cancel).await.unwrap(), 1);
        assert_eq!(store.get(&key("1")), Some(json!({"total": 10})));
        assert_eq!(session.flush_count(), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn staged_delete_hides_committed_record() {
        let store = Arc::new(InMemoryDataStore::new());
        let cancel = CancellationToken::new();
        let writer = InMemorySession::new("Orders", store.clone());
        writer
            .stage(PendingWrite::Upsert {
                key: key("1"),
                value: json!(1),
            })
            .unwrap();
        writer.persist_changes(&cancel).await.unwrap();

        let session = InMemorySession::new("Orders", store.clone());
        session.stage(PendingWrite::Delete { key: key("1") }).unwrap();

        assert_eq!(session.load(&key("1"), &cancel).await.unwrap(), None);
        assert!(store.get(&key("1")).is_some());
    }

    #[tokio::test]
    async fn dispose_discards_pending_writes_and_rejects_further_use() {
        let store = Arc::new(InMemoryDataStore::new());
        let session = InMemorySession::new("Orders", store.clone());
        session
            .stage(PendingWrite::Upsert {
                key: key("1"),
                value: json!(1),
            })
            .unwrap();

        session.dispose();

        assert!(session.is_disposed());
        assert_eq!(session.pending_writes(), 0);
        assert!(matches!(
            session.persist_changes(&CancellationToken::new()).await,
            Err(SessionError::Disposed)
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cancelled_flush_applies_nothing() {
        let store = Arc::new(InMemoryDataStore::new());
        let session = InMemorySession::new("Orders", store.clone());
        session
            .stage(PendingWrite::Upsert {
                key: key("1"),
                value: json!(1),
            })
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            session.persist_changes(&cancel).await,
            Err(SessionError::Cancelled)
        ));
        assert_eq!(session.pending_writes(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn factory_keeps_only_the_most_recent_sessions() {
        let factory = InMemorySessionFactory::new(Arc::new(InMemoryDataStore::new()));
        let cancel = CancellationToken::new();

        for _ in 0..RECENT_SESSIONS + 3 {
            factory.open("Orders", &cancel).await.unwrap();
        }
        let newest = factory.open("Orders", &cancel).await.unwrap();
        newest
            .stage(PendingWrite::Delete { key: key("1") })
            .unwrap();

        let kept = factory.opened_sessions();
        assert_eq!(kept.len(), RECENT_SESSIONS);
        assert_eq!(kept.last().unwrap().pending_writes(), 1);
        assert!(kept[..RECENT_SESSIONS - 1].iter().all(|s| s.pending_writes() == 0));
    }
}
