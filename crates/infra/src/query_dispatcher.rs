//! Query execution pipeline.
//!
//! ```text
//! Query
//!   ↓
//! 1. Resolve the required handler for Q           → RequiredServiceMissing
//!   ↓
//! 2. Validate (when `validation.queries_enabled`) → Validation (all faults)
//!   ↓
//! 3. Check cancellation                           → Cancelled
//!   ↓
//! 4. caching.enabled && query.cache_policy()?
//!      yes → CachePort::get_or_create(key, policy, handler)
//!      no  → handler
//! ```

use core::any::type_name;
use std::sync::Arc;

use tracing::{debug, warn};

use meridian_events::Query;

use crate::cache::{CacheError, CachePort, ComputeFuture, cache_key};
use crate::config::{DispatchOptions, SharedOptions};
use crate::context::DispatchContext;
use crate::error::DispatchError;
use crate::handler_registry::HandlerRegistry;
use crate::validation::ValidationPipeline;

/// Routes queries to their registered handler, optionally through the cache.
#[derive(Clone)]
pub struct QueryDispatcher {
    handlers: Arc<HandlerRegistry>,
    validation: Arc<ValidationPipeline>,
    cache: Arc<dyn CachePort>,
    options: SharedOptions,
}

impl core::fmt::Debug for QueryDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueryDispatcher")
            .field("handlers", &self.handlers)
            .field("validation", &self.validation)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl QueryDispatcher {
    pub fn new(
        handlers: impl Into<Arc<HandlerRegistry>>,
        validation: impl Into<Arc<ValidationPipeline>>,
        cache: Arc<dyn CachePort>,
        options: SharedOptions,
    ) -> Self {
        Self {
            handlers: handlers.into(),
            validation: validation.into(),
            cache,
            options,
        }
    }

    /// Current options, including the pass-through
    /// `caching.dynamic_expression_caching_enabled` flag for query-translation
    /// backends.
    pub fn options(&self) -> DispatchOptions {
        self.options.snapshot()
    }

    pub async fn dispatch<Q: Query>(&self, query: Q, ctx: &DispatchContext<'_>) -> Result<Q::Output, DispatchError> {
        let request = type_name::<Q>();
        let options = self.options.snapshot();
        debug!(
            request,
            scope = ?ctx.scope().map(|s| s.id()),
            validate = options.validation.queries_enabled,
            cache = options.caching.enabled,
            "dispatching query"
        );

        let handler = self.handlers.resolve_required_single::<Q>().inspect_err(|err| {
            warn!(request, error = %err, "query handler resolution failed");
        })?;

        if options.validation.queries_enabled {
            self.validation
                .validate(&query, true, ctx.cancellation())
                .await
                .inspect_err(|err| debug!(request, error = %err, "query rejected by validation"))?;
        }

        ctx.ensure_active(request)?;

        let policy = match query.cache_policy() {
            Some(policy) if options.caching.enabled => policy,
            _ => return handler.handle(query, ctx).await,
        };

        let key = cache_key(&query, &policy)?;
        let compute: ComputeFuture<'_> = Box::pin(async move {
            let output = handler.handle(query, ctx).await?;
            serde_json::to_value(output).map_err(|e| DispatchError::Cache(CacheError::from(e)))
        });

        let value = self.cache.get_or_create(&key, &policy, compute).await?;
        serde_json::from_value(value).map_err(|e| {
            warn!(request, key = %key, error = %e, "cached value does not match the query output");
            DispatchError::Cache(CacheError::from(e))
        })
    }
}
