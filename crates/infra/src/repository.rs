//! JSON-backed repository over persistence sessions.
//!
//! A repository is bound to one store and one collection. Every call resolves
//! its session through the [`SessionResolver`]:
//!
//! - inside a transaction scope, writes are staged on the scope's session for
//!   the store and become durable when the scope completes
//! - outside a scope, each write runs on an ad-hoc session that is flushed and
//!   disposed before the call returns
//!
//! Records are addressed by the entity's [`EntityKey`] rendered as a string.

use core::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use meridian_core::EntityKey;
use meridian_events::{BusinessEntity, EntityHandle};

use crate::persistence::{PendingWrite, PersistenceError, RecordKey, ResolvedSession, SessionError, SessionResolver};
use crate::transaction::TransactionScope;

pub struct Repository<T> {
    resolver: SessionResolver,
    store: String,
    collection: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            store: self.store.clone(),
            collection: self.collection.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> core::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Repository")
            .field("store", &self.store)
            .field("collection", &self.collection)
            .finish()
    }
}

impl<T> Repository<T>
where
    T: BusinessEntity + Serialize + DeserializeOwned,
{
    pub fn new(resolver: SessionResolver, store: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            resolver,
            store: store.into(),
            collection: collection.into(),
            _marker: PhantomData,
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    fn record_key(&self, key: &EntityKey) -> RecordKey {
        RecordKey::new(self.collection.clone(), key.to_string())
    }

    fn session_error(&self, source: impl Into<SessionError>) -> PersistenceError {
        PersistenceError::session(&self.store, source.into())
    }

    async fn resolve(
        &self,
        scope: Option<&TransactionScope>,
        cancel: &CancellationToken,
    ) -> Result<ResolvedSession, PersistenceError> {
        self.resolver.resolve(scope, &self.store, cancel).await
    }

    pub async fn load(
        &self,
        scope: Option<&TransactionScope>,
        key: &EntityKey,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, PersistenceError> {
        let resolved = self.resolve(scope, cancel).await?;
        let loaded = resolved.session().load(&self.record_key(key), cancel).await;
        resolved.finish(false, cancel).await?;

        match loaded.map_err(|e| self.session_error(e))? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| self.session_error(e)),
            None => Ok(None),
        }
    }

    /// Load an entity into the scope's arena.
    pub async fn load_tracked(
        &self,
        scope: &TransactionScope,
        key: &EntityKey,
        cancel: &CancellationToken,
    ) -> Result<Option<EntityHandle<T>>, PersistenceError> {
        Ok(self
            .load(Some(scope), key, cancel)
            .await?
            .map(|entity| scope.tracker().attach(entity)))
    }

    /// Write `entity`. Returns the number of writes made durable by this call
    /// (0 inside a scope, where the scope flushes on completion).
    pub async fn save(
        &self,
        scope: Option<&TransactionScope>,
        entity: &T,
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        let value = serde_json::to_value(entity).map_err(|e| self.session_error(e))?;
        self.stage(
            scope,
            PendingWrite::Upsert {
                key: self.record_key(&entity.key()),
                value,
            },
            cancel,
        )
        .await
    }

    /// Stage an attached entity on the scope's session and hand its local
    /// events to the scope's tracker.
    ///
    /// Returns `true` if the entity became tracked by this call.
    pub async fn save_tracked(
        &self,
        scope: &TransactionScope,
        handle: &EntityHandle<T>,
        cancel: &CancellationToken,
    ) -> Result<bool, PersistenceError> {
        let (key, value) = scope
            .tracker()
            .with_entity(handle, |entity| (entity.key(), serde_json::to_value(entity)))
            .ok_or_else(|| PersistenceError::EntityNotAttached {
                store: self.store.clone(),
            })?;
        let value = value.map_err(|e| self.session_error(e))?;

        self.stage(
            Some(scope),
            PendingWrite::Upsert {
                key: self.record_key(&key),
                value,
            },
            cancel,
        )
        .await?;

        let tracked = scope.tracker().add_entity(handle);
        debug!(store = %self.store, entity = %key, tracked, "entity staged");
        Ok(tracked)
    }

    pub async fn delete(
        &self,
        scope: Option<&TransactionScope>,
        key: &EntityKey,
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        self.stage(
            scope,
            PendingWrite::Delete {
                key: self.record_key(key),
            },
            cancel,
        )
        .await
    }

    async fn stage(
        &self,
        scope: Option<&TransactionScope>,
        write: PendingWrite,
        cancel: &CancellationToken,
    ) -> Result<usize, PersistenceError> {
        let resolved = self.resolve(scope, cancel).await?;
        if let Err(source) = resolved.session().stage(write) {
            resolved.finish(false, cancel).await?;
            return Err(self.session_error(source));
        }
        resolved.finish(true, cancel).await
    }
}
