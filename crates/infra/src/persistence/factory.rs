use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{PersistenceError, SessionError};
use super::session::PersistenceSession;

/// Produces new sessions for one named store.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        store: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn PersistenceSession>, SessionError>;
}

#[async_trait]
impl<F> SessionFactory for Arc<F>
where
    F: SessionFactory + ?Sized,
{
    async fn open(
        &self,
        store: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn PersistenceSession>, SessionError> {
        (**self).open(store, cancel).await
    }
}

/// Named session factories, registered once at startup (one per store).
#[derive(Default, Clone)]
pub struct SessionFactories {
    factories: HashMap<String, Arc<dyn SessionFactory>>,
}

impl core::fmt::Debug for SessionFactories {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut stores: Vec<_> = self.factories.keys().collect();
        stores.sort();
        f.debug_struct("SessionFactories").field("stores", &stores).finish()
    }
}

impl SessionFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `store`. A store can only be registered once.
    pub fn register(
        &mut self,
        store: impl Into<String>,
        factory: impl SessionFactory + 'static,
    ) -> Result<(), PersistenceError> {
        let store = store.into();
        if self.factories.contains_key(&store) {
            return Err(PersistenceError::DuplicateFactory(store));
        }
        self.factories.insert(store, Arc::new(factory));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(
        mut self,
        store: impl Into<String>,
        factory: impl SessionFactory + 'static,
    ) -> Result<Self, PersistenceError> {
        self.register(store, factory)?;
        Ok(self)
    }

    pub fn contains(&self, store: &str) -> bool {
        self.factories.contains_key(store)
    }

    /// Open a fresh session for `store`, wrapping failures with the store name.
    pub async fn open(
        &self,
        store: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn PersistenceSession>, PersistenceError> {
        let factory = self
            .factories
            .get(store)
            .ok_or_else(|| PersistenceError::UnknownStore(store.to_string()))?;

        let session = factory
            .open(store, cancel)
            .await
            .map_err(|source| PersistenceError::SessionCreation {
                store: store.to_string(),
                source,
            })?;

        debug!(store, "opened persistence session");
        Ok(session)
    }
}
