use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::transaction::TransactionScope;

/// Per-call context handed to handlers: the ambient unit of work (if any) and
/// the caller's cancellation token.
#[derive(Debug, Clone)]
pub struct DispatchContext<'s> {
    scope: Option<&'s TransactionScope>,
    cancel: CancellationToken,
}

impl<'s> DispatchContext<'s> {
    /// Context without a transaction scope.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            scope: None,
            cancel,
        }
    }

    pub fn with_scope(scope: &'s TransactionScope, cancel: CancellationToken) -> Self {
        Self {
            scope: Some(scope),
            cancel,
        }
    }

    pub fn scope(&self) -> Option<&'s TransactionScope> {
        self.scope
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`DispatchError::Cancelled`] if the caller gave up.
    pub fn ensure_active(&self, request: &'static str) -> Result<(), DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled { request });
        }
        Ok(())
    }
}

impl Default for DispatchContext<'_> {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
