//! Transaction scopes (units of work).
//!
//! A [`TransactionContext`] represents one logical execution flow (typically
//! one inbound request). It hands out at most one open [`TransactionScope`] at
//! a time; the scope is passed explicitly to dispatchers and repositories as
//! `Option<&TransactionScope>`.
//!
//! ## Lifecycle
//!
//! ```text
//! begin() ──▶ Open ──complete()──▶ Completed   (flush sessions in registration order,
//!               │                                then emit tracked entity events)
//!               └──dispose()/drop──▶ Disposed  (sessions disposed unflushed,
//!                                              pending events discarded)
//! ```
//!
//! `complete` and `dispose` consume the scope, so a finished scope cannot be
//! used again.
//!
//! ## Failure semantics
//!
//! Flushes run sequentially. The first failure (or a cancellation between
//! flushes) stops completion: stores flushed before it stay flushed (there is
//! no two-phase commit across stores), the rest are disposed unflushed, and
//! no events are emitted. Event emission happens only after every flush
//! succeeded; an emission failure is reported after the data is persisted and
//! hands back the tracker with the unpublished events for a later retry.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meridian_core::ScopeId;
use meridian_events::{EmitError, EntityEventTracker, EventPublisher};

use crate::persistence::{PersistenceError, SessionRegistry};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("a transaction scope is already active in this context ({active})")]
    AlreadyActive { active: ScopeId },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("completion of scope {scope} cancelled after flushing {flushed:?}")]
    Cancelled { scope: ScopeId, flushed: Vec<String> },

    /// Data is committed; `undelivered` still tracks the events that were not
    /// published and can be drained again.
    #[error("events of scope {scope} could not be emitted: {source}")]
    EventEmission {
        scope: ScopeId,
        #[source]
        source: EmitError,
        undelivered: Box<EntityEventTracker>,
    },
}

impl TransactionError {
    /// Tracker holding the unpublished events of a committed scope.
    pub fn into_undelivered(self) -> Option<EntityEventTracker> {
        match self {
            TransactionError::EventEmission { undelivered, .. } => Some(*undelivered),
            _ => None,
        }
    }
}

/// What a successful completion did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub scope: ScopeId,
    /// Flushed stores, in flush (registration) order.
    pub flushed: Vec<String>,
    pub writes_applied: usize,
    pub events_published: usize,
}

/// One logical execution flow; owns the "current scope" slot.
#[derive(Clone)]
pub struct TransactionContext {
    current: Arc<Mutex<Option<ScopeId>>>,
    publisher: Arc<dyn EventPublisher>,
}

impl core::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("current", &self.current_scope())
            .finish_non_exhaustive()
    }
}

impl TransactionContext {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            publisher,
        }
    }

    /// Open a scope. Fails fast if this context already has an open scope.
    pub fn begin(&self) -> Result<TransactionScope, TransactionError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = *current {
            warn!(active = %active, "refusing to open a nested transaction scope");
            return Err(TransactionError::AlreadyActive { active });
        }

        let id = ScopeId::new();
        *current = Some(id);
        debug!(scope = %id, "transaction scope opened");

        Ok(TransactionScope {
            id,
            slot: self.current.clone(),
            sessions: SessionRegistry::new(),
            tracker: EntityEventTracker::new(),
            publisher: self.publisher.clone(),
            finished: false,
        })
    }

    pub fn current_scope(&self) -> Option<ScopeId> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_active_scope(&self) -> bool {
        self.current_scope().is_some()
    }
}

/// Unit of work: the sessions opened under it and the entities it tracks.
pub struct TransactionScope {
    id: ScopeId,
    slot: Arc<Mutex<Option<ScopeId>>>,
    sessions: SessionRegistry,
    tracker: EntityEventTracker,
    publisher: Arc<dyn EventPublisher>,
    finished: bool,
}

impl core::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("sessions", &self.sessions)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl TransactionScope {
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Entity arena + event tracker of this unit of work.
    pub fn tracker(&self) -> &EntityEventTracker {
        &self.tracker
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Flush every session (registration order), then emit tracked events.
    ///
    /// A session stays registered until its flush succeeds, so dropping the
    /// returned future disposes every session not yet flushed.
    pub async fn complete(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<CompletionReport, TransactionError> {
        let mut flushed = Vec::new();
        let mut writes_applied = 0usize;

        while let Some((store, session)) = self.sessions.first() {
            if cancel.is_cancelled() {
                self.dispose_sessions();
                self.abandon("completion cancelled");
                return Err(TransactionError::Cancelled {
                    scope: self.id,
                    flushed,
                });
            }

            match session.persist_changes(cancel).await {
                Ok(applied) => {
                    debug!(scope = %self.id, store = %store, applied, "session flushed");
                    self.sessions.remove_first();
                    session.dispose();
                    writes_applied += applied;
                    flushed.push(store);
                }
                Err(source) => {
                    self.dispose_sessions();
                    warn!(
                        scope = %self.id,
                        store = %store,
                        already_flushed = ?flushed,
                        error = %source,
                        "session flush failed; remaining sessions disposed"
                    );
                    self.abandon("flush failed");
                    return Err(PersistenceError::Flush { store, source }.into());
                }
            }
        }

        let emitted = self
            .tracker
            .emit_transactional_events(self.publisher.as_ref(), cancel)
            .await;
        self.release();

        let events_published = match emitted {
            Ok(published) => published,
            Err(source) => {
                let undelivered = std::mem::take(&mut self.tracker);
                warn!(
                    scope = %self.id,
                    error = %source,
                    pending = undelivered.pending_event_count(),
                    "event emission failed after commit"
                );
                return Err(TransactionError::EventEmission {
                    scope: self.id,
                    source,
                    undelivered: Box::new(undelivered),
                });
            }
        };

        info!(
            scope = %self.id,
            stores = flushed.len(),
            writes_applied,
            events_published,
            "transaction scope completed"
        );

        Ok(CompletionReport {
            scope: self.id,
            flushed,
            writes_applied,
            events_published,
        })
    }

    /// End the scope without flushing. Returns the number of discarded events.
    pub fn dispose(mut self) -> usize {
        self.dispose_sessions();
        self.abandon("disposed")
    }

    fn dispose_sessions(&mut self) {
        for (_, session) in self.sessions.take_all() {
            session.dispose();
        }
    }

    /// Drop pending events and release the context slot.
    fn abandon(&mut self, reason: &str) -> usize {
        let discarded = self.tracker.discard_pending();
        self.release();
        debug!(scope = %self.id, reason, discarded, "transaction scope ended uncommitted");
        discarded
    }

    fn release(&mut self) {
        self.finished = true;
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if *slot == Some(self.id) {
            *slot = None;
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if !self.finished {
            warn!(scope = %self.id, "transaction scope dropped without completion; discarding changes");
            self.dispose_sessions();
            self.abandon("dropped");
        }
    }
}
