use thiserror::Error;

/// Failure reported by a session or session factory implementation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is disposed")]
    Disposed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure (driver, network, constraint, ...).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence operation error, annotated with the store it concerns.
///
/// These are **infrastructure errors**; the registry and scope add the store
/// name but always keep the session's error as the source.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("no session factory registered for store '{0}'")]
    UnknownStore(String),

    #[error("a session factory is already registered for store '{0}'")]
    DuplicateFactory(String),

    #[error("opening a session for store '{store}' failed: {source}")]
    SessionCreation {
        store: String,
        #[source]
        source: SessionError,
    },

    #[error("flushing store '{store}' failed: {source}")]
    Flush {
        store: String,
        #[source]
        source: SessionError,
    },

    #[error("entity handle for store '{store}' does not refer to an attached entity")]
    EntityNotAttached { store: String },

    #[error("session operation on store '{store}' failed: {source}")]
    Session {
        store: String,
        #[source]
        source: SessionError,
    },
}

impl PersistenceError {
    pub fn store(&self) -> &str {
        match self {
            PersistenceError::UnknownStore(store)
            | PersistenceError::DuplicateFactory(store)
            | PersistenceError::SessionCreation { store, .. }
            | PersistenceError::Flush { store, .. }
            | PersistenceError::EntityNotAttached { store }
            | PersistenceError::Session { store, .. } => store,
        }
    }

    pub(crate) fn session(store: &str, source: SessionError) -> Self {
        PersistenceError::Session {
            store: store.to_string(),
            source,
        }
    }
}
