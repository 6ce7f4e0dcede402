//! Command execution pipeline (application-level orchestration).
//!
//! ## Command Execution Flow
//!
//! ```text
//! Command
//!   ↓
//! 1. Resolve exactly one handler for (C, R)       → NoHandlersFound / AmbiguousHandlers
//!   ↓
//! 2. Validate (when `validation.commands_enabled`) → Validation (all faults)
//!   ↓
//! 3. Check cancellation                            → Cancelled
//!   ↓
//! 4. Invoke the handler with the dispatch context  → handler result, unchanged
//! ```
//!
//! Commands are never cached. Persistence and event emission are not the
//! dispatcher's business: handlers stage writes through repositories resolved
//! against the context's transaction scope, and the caller completes the scope.
//!
//! This module contains no IO itself; it composes the registry, the validation
//! pipeline and the options.

use core::any::type_name;
use std::sync::Arc;

use tracing::{debug, warn};

use meridian_events::Command;

use crate::config::SharedOptions;
use crate::context::DispatchContext;
use crate::error::DispatchError;
use crate::handler_registry::HandlerRegistry;
use crate::validation::ValidationPipeline;

/// Routes commands to their single registered handler.
///
/// ## Error Semantics
///
/// - **Configuration errors**: zero or several handlers for `(C, R)`; the
///   handler is never invoked and validation never runs
/// - **Validation errors**: faults abort before the handler runs
/// - **Handler errors**: returned unchanged
///
/// Options are snapshotted once per call; an update made while a command is
/// in flight applies to the next dispatch.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    handlers: Arc<HandlerRegistry>,
    validation: Arc<ValidationPipeline>,
    options: SharedOptions,
}

impl CommandDispatcher {
    pub fn new(
        handlers: impl Into<Arc<HandlerRegistry>>,
        validation: impl Into<Arc<ValidationPipeline>>,
        options: SharedOptions,
    ) -> Self {
        Self {
            handlers: handlers.into(),
            validation: validation.into(),
            options,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Dispatch `command` to the handler registered for `(C, R)`.
    pub async fn dispatch<C, R>(&self, command: C, ctx: &DispatchContext<'_>) -> Result<R, DispatchError>
    where
        C: Command,
        R: Send + 'static,
    {
        let request = type_name::<C>();
        let options = self.options.snapshot();
        debug!(
            request,
            scope = ?ctx.scope().map(|s| s.id()),
            validate = options.validation.commands_enabled,
            "dispatching command"
        );

        let handler = self.handlers.resolve_exactly_one::<C, R>().inspect_err(|err| {
            warn!(request, error = %err, "command handler resolution failed");
        })?;

        if options.validation.commands_enabled {
            self.validation
                .validate(&command, true, ctx.cancellation())
                .await
                .inspect_err(|err| debug!(request, error = %err, "command rejected by validation"))?;
        }

        ctx.ensure_active(request)?;

        handler
            .handle(command, ctx)
            .await
            .inspect_err(|err| debug!(request, error = %err, "command handler failed"))
    }
}
