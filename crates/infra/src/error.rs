use thiserror::Error;

use meridian_core::{DomainError, ValidationError};

use crate::cache::CacheError;
use crate::persistence::PersistenceError;
use crate::transaction::TransactionError;

/// Failure of a command or query dispatch.
///
/// ## Error Semantics
///
/// - **Configuration errors** (`NoHandlersFound`, `AmbiguousHandlers`,
///   `RequiredServiceMissing`): the handler registry is wired wrong; fatal,
///   never retried, the handler is never invoked
/// - **Validation errors**: the request was rejected before reaching its
///   handler; carries every fault
/// - **Everything else** comes from the handler or the infrastructure it used
///   and is returned with its source intact
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for {request} -> {result}")]
    NoHandlersFound {
        request: &'static str,
        result: &'static str,
    },

    #[error("{count} handlers registered for {request} -> {result}; expected exactly one")]
    AmbiguousHandlers {
        request: &'static str,
        result: &'static str,
        count: usize,
    },

    #[error("required service not registered: {service}")]
    RequiredServiceMissing { service: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("dispatch of {request} cancelled")]
    Cancelled { request: &'static str },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Opaque handler failure.
    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
}

impl DispatchError {
    /// `true` for wiring mistakes that no retry can fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DispatchError::NoHandlersFound { .. }
                | DispatchError::AmbiguousHandlers { .. }
                | DispatchError::RequiredServiceMissing { .. }
        )
    }

    /// Faults carried by a validation failure.
    pub fn validation_faults(&self) -> Option<&[meridian_core::ValidationFault]> {
        match self {
            DispatchError::Validation(err) => Some(err.faults()),
            _ => None,
        }
    }
}
