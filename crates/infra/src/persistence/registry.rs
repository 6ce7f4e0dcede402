use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::PersistenceError;
use super::factory::SessionFactories;
use super::session::PersistenceSession;
use crate::transaction::TransactionScope;

type Entry = (String, Arc<dyn PersistenceSession>);

/// Sessions opened under one transaction scope, keyed by store name, in
/// registration order.
///
/// The check-then-create step runs under a single async mutex, so concurrent
/// resolution of the same store within one scope opens exactly one session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<Entry>>,
}

impl core::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.sessions.try_lock() {
            Ok(sessions) => {
                let stores: Vec<_> = sessions.iter().map(|(s, _)| s.as_str()).collect();
                f.debug_struct("SessionRegistry").field("stores", &stores).finish()
            }
            Err(_) => f.debug_struct("SessionRegistry").finish_non_exhaustive(),
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session registered for `store`, opening it on first access.
    pub async fn get_or_open(
        &self,
        store: &str,
        factories: &SessionFactories,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn PersistenceSession>, PersistenceError> {
        let mut sessions = self.sessions.lock().await;
        if let Some((_, session)) = sessions.iter().find(|(name, _)| name == store) {
            return Ok(session.clone());
        }

        let session = factories.open(store, cancel).await?;
        sessions.push((store.to_string(), session.clone()));
        debug!(store, registered = sessions.len(), "registered session in scope");
        Ok(session)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Registered store names, in registration order.
    pub async fn store_names(&self) -> Vec<String> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Remove every session, in registration order (owner-only access).
    pub(crate) fn take_all(&mut self) -> Vec<Entry> {
        std::mem::take(self.sessions.get_mut())
    }

    /// Earliest registered session, left in place.
    pub(crate) fn first(&mut self) -> Option<Entry> {
        self.sessions.get_mut().first().cloned()
    }

    pub(crate) fn remove_first(&mut self) -> Option<Entry> {
        let sessions = self.sessions.get_mut();
        (!sessions.is_empty()).then(|| sessions.remove(0))
    }
}

/// A session handed to a repository for one call.
pub struct ResolvedSession {
    session: Arc<dyn PersistenceSession>,
    ad_hoc: bool,
}

impl ResolvedSession {
    pub fn session(&self) -> &Arc<dyn PersistenceSession> {
        &self.session
    }

    pub fn store_name(&self) -> &str {
        self.session.store_name()
    }

    /// `true` when resolved outside a transaction scope: the caller owns the
    /// session and must [`finish`](Self::finish) it.
    pub fn is_ad_hoc(&self) -> bool {
        self.ad_hoc
    }

    /// End the caller's use of the session.
    ///
    /// Ad-hoc sessions are flushed (when `flush` is set) and disposed, making
    /// the call its own atomic unit. Scoped sessions are left untouched; the
    /// scope flushes them on completion.
    pub async fn finish(self, flush: bool, cancel: &CancellationToken) -> Result<usize, PersistenceError> {
        if !self.ad_hoc {
            return Ok(0);
        }

        let store = self.session.store_name().to_string();
        let result = if flush {
            self.session
                .persist_changes(cancel)
                .await
                .map_err(|source| PersistenceError::Flush {
                    store: store.clone(),
                    source,
                })
        } else {
            Ok(0)
        };
        self.session.dispose();

        if let Err(err) = &result {
            warn!(store = %store, error = %err, "ad-hoc flush failed");
        }
        result
    }
}

impl core::fmt::Debug for ResolvedSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResolvedSession")
            .field("store", &self.session.store_name())
            .field("ad_hoc", &self.ad_hoc)
            .finish()
    }
}

/// Resolves the session a repository should use for a store.
///
/// - outside a scope: a fresh ad-hoc session per call
/// - inside a scope: the scope's single session for that store
#[derive(Debug, Clone)]
pub struct SessionResolver {
    factories: Arc<SessionFactories>,
}

impl SessionResolver {
    pub fn new(factories: impl Into<Arc<SessionFactories>>) -> Self {
        Self {
            factories: factories.into(),
        }
    }

    pub fn factories(&self) -> &SessionFactories {
        &self.factories
    }

    pub async fn resolve(
        &self,
        scope: Option<&TransactionScope>,
        store: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedSession, PersistenceError> {
        match scope {
            Some(scope) => {
                let session = scope
                    .sessions()
                    .get_or_open(store, &self.factories, cancel)
                    .await?;
                Ok(ResolvedSession {
                    session,
                    ad_hoc: false,
                })
            }
            None => {
                let session = self.factories.open(store, cancel).await?;
                Ok(ResolvedSession {
                    session,
                    ad_hoc: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::persistence::{InMemoryDataStore, InMemorySessionFactory};

    const STORES: [&str; 4] = ["Orders", "Billing", "Audit", "Crm"];

    fn factories() -> SessionFactories {
        let mut factories = SessionFactories::new();
        for store in STORES {
            factories
                .register(store, InMemorySessionFactory::new(Arc::new(InMemoryDataStore::new())))
                .unwrap();
        }
        factories
    }

    #[tokio::test]
    async fn ad_hoc_sessions_are_flushed_and_disposed_by_finish() {
        let resolver = SessionResolver::new(factories());
        let cancel = CancellationToken::new();

        let resolved = resolver.resolve(None, "Orders", &cancel).await.unwrap();
        assert!(resolved.is_ad_hoc());
        let session = resolved.session().clone();

        resolved.finish(true, &cancel).await.unwrap();
        assert!(session.is_disposed());
    }

    #[tokio::test]
    async fn ad_hoc_resolution_never_reuses_sessions() {
        let resolver = SessionResolver::new(factories());
        let cancel = CancellationToken::new();

        let a = resolver.resolve(None, "Orders", &cancel).await.unwrap();
        let b = resolver.resolve(None, "Orders", &cancel).await.unwrap();

        assert!(!Arc::ptr_eq(a.session(), b.session()));
    }

    #[tokio::test]
    async fn session_creation_failure_names_the_store() {
        let resolver = SessionResolver::new(factories());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = resolver.resolve(None, "Billing", &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::SessionCreation { ref store, .. } if store == "Billing"
        ));
    }

    proptest! {
        #[test]
        fn registry_keeps_first_registration_order(picks in prop::collection::vec(0usize..STORES.len(), 0..24)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let factories = factories();
            let registry = SessionRegistry::new();
            let cancel = CancellationToken::new();

            let mut expected: Vec<String> = Vec::new();
            runtime.block_on(async {
                for &i in &picks {
                    registry.get_or_open(STORES[i], &factories, &cancel).await.unwrap();
                    if !expected.iter().any(|s| s == STORES[i]) {
                        expected.push(STORES[i].to_string());
                    }
                }
            });

            prop_assert_eq!(runtime.block_on(registry.store_names()), expected);
        }
    }
}
