//! Explicit handler registry.
//!
//! Handlers are registered at startup as factory closures keyed by the request
//! type (and, for commands, the result type). A fresh handler instance is
//! produced by its factory on every dispatch; nothing is cached across calls.
//!
//! Two resolution strategies exist and are deliberately different:
//!
//! - [`HandlerRegistry::resolve_exactly_one`] (commands): every registration
//!   for `(C, R)` is kept; zero or several registrations are configuration
//!   errors
//! - [`HandlerRegistry::resolve_required_single`] (queries): one slot per
//!   query type, a later registration replaces an earlier one; an empty slot
//!   is a missing required service

use core::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use meridian_events::{Command, Query};

use crate::context::DispatchContext;
use crate::error::DispatchError;

/// Handles one command type, producing one result type.
#[async_trait]
pub trait CommandHandler<C, R>: Send + Sync
where
    C: Command,
    R: Send + 'static,
{
    async fn handle(&self, command: C, ctx: &DispatchContext<'_>) -> Result<R, DispatchError>;
}

/// Handles one query type.
#[async_trait]
pub trait QueryHandler<Q>: Send + Sync
where
    Q: Query,
{
    async fn handle(&self, query: Q, ctx: &DispatchContext<'_>) -> Result<Q::Output, DispatchError>;
}

type CommandFactory<C, R> = Arc<dyn Fn() -> Box<dyn CommandHandler<C, R>> + Send + Sync>;
type QueryFactory<Q> = Arc<dyn Fn() -> Box<dyn QueryHandler<Q>> + Send + Sync>;

type ErasedFactory = Box<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    commands: HashMap<(TypeId, TypeId), Vec<ErasedFactory>>,
    queries: HashMap<TypeId, ErasedFactory>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("command_registrations", &self.commands.values().map(Vec::len).sum::<usize>())
            .field("query_registrations", &self.queries.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command handler factory for `(C, R)`.
    pub fn register_command<C, R, H, F>(&mut self, factory: F) -> &mut Self
    where
        C: Command,
        R: Send + 'static,
        H: CommandHandler<C, R> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: CommandFactory<C, R> =
            Arc::new(move || -> Box<dyn CommandHandler<C, R>> { Box::new(factory()) });
        self.commands
            .entry((TypeId::of::<C>(), TypeId::of::<R>()))
            .or_default()
            .push(Box::new(factory));
        self
    }

    /// Set the query handler factory for `Q`, replacing any earlier one.
    pub fn register_query<Q, H, F>(&mut self, factory: F) -> &mut Self
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: QueryFactory<Q> =
            Arc::new(move || -> Box<dyn QueryHandler<Q>> { Box::new(factory()) });
        self.queries.insert(TypeId::of::<Q>(), Box::new(factory));
        self
    }

    /// Number of handler registrations for `(C, R)`.
    pub fn command_handler_count<C, R>(&self) -> usize
    where
        C: Command,
        R: Send + 'static,
    {
        self.commands
            .get(&(TypeId::of::<C>(), TypeId::of::<R>()))
            .map_or(0, Vec::len)
    }

    pub fn has_query_handler<Q: Query>(&self) -> bool {
        self.queries.contains_key(&TypeId::of::<Q>())
    }

    /// Instantiate the single handler registered for `(C, R)`.
    pub fn resolve_exactly_one<C, R>(&self) -> Result<Box<dyn CommandHandler<C, R>>, DispatchError>
    where
        C: Command,
        R: Send + 'static,
    {
        let factories: Vec<&CommandFactory<C, R>> = self
            .commands
            .get(&(TypeId::of::<C>(), TypeId::of::<R>()))
            .map(|v| v.iter().filter_map(|f| f.downcast_ref()).collect())
            .unwrap_or_default();

        match factories.as_slice() {
            [] => Err(DispatchError::NoHandlersFound {
                request: type_name::<C>(),
                result: type_name::<R>(),
            }),
            [factory] => Ok(factory()),
            many => Err(DispatchError::AmbiguousHandlers {
                request: type_name::<C>(),
                result: type_name::<R>(),
                count: many.len(),
            }),
        }
    }

    /// Instantiate the handler registered for `Q`.
    pub fn resolve_required_single<Q: Query>(&self) -> Result<Box<dyn QueryHandler<Q>>, DispatchError> {
        self.queries
            .get(&TypeId::of::<Q>())
            .and_then(|f| f.downcast_ref::<QueryFactory<Q>>())
            .map(|factory| factory())
            .ok_or_else(|| DispatchError::RequiredServiceMissing {
                service: format!("QueryHandler<{}>", type_name::<Q>()),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Serialize;

    use super::*;

    #[derive(Debug)]
    struct Ping;

    impl Command for Ping {}

    #[derive(Debug, Serialize)]
    struct Lookup;

    impl Query for Lookup {
        type Output = String;
    }

    struct Pong(&'static str);

    #[async_trait]
    impl CommandHandler<Ping, String> for Pong {
        async fn handle(&self, _command: Ping, _ctx: &DispatchContext<'_>) -> Result<String, DispatchError> {
            Ok(self.0.to_string())
        }
    }

    struct Answer(&'static str);

    #[async_trait]
    impl QueryHandler<Lookup> for Answer {
        async fn handle(&self, _query: Lookup, _ctx: &DispatchContext<'_>) -> Result<String, DispatchError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn unregistered_command_is_a_configuration_error() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve_exactly_one::<Ping, String>().err().unwrap();
        assert!(matches!(err, DispatchError::NoHandlersFound { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn result_type_is_part_of_the_key() {
        let mut registry = HandlerRegistry::new();
        registry.register_command::<Ping, String, _, _>(|| Pong("a"));

        assert_eq!(registry.command_handler_count::<Ping, String>(), 1);
        assert_eq!(registry.command_handler_count::<Ping, u32>(), 0);
        assert!(registry.resolve_exactly_one::<Ping, u32>().is_err());
    }

    #[test]
    fn two_command_registrations_are_ambiguous() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_command::<Ping, String, _, _>(|| Pong("a"))
            .register_command::<Ping, String, _, _>(|| Pong("b"));

        let err = registry.resolve_exactly_one::<Ping, String>().err().unwrap();
        assert!(matches!(err, DispatchError::AmbiguousHandlers { count: 2, .. }));
    }

    #[tokio::test]
    async fn factory_runs_on_every_resolution() {
        static CREATED: AtomicUsize = AtomicUsize::new(0);
        let mut registry = HandlerRegistry::new();
        registry.register_command::<Ping, String, _, _>(|| {
            CREATED.fetch_add(1, Ordering::SeqCst);
            Pong("a")
        });

        let ctx = DispatchContext::default();
        for _ in 0..3 {
            let handler = registry.resolve_exactly_one::<Ping, String>().unwrap();
            assert_eq!(handler.handle(Ping, &ctx).await.unwrap(), "a");
        }
        assert_eq!(CREATED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn missing_query_handler_is_a_missing_required_service() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve_required_single::<Lookup>().err().unwrap();
        match err {
            DispatchError::RequiredServiceMissing { service } => assert!(service.contains("Lookup")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn last_query_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_query::<Lookup, _, _>(|| Answer("first"))
            .register_query::<Lookup, _, _>(|| Answer("second"));

        let handler = registry.resolve_required_single::<Lookup>().unwrap();
        let out = handler.handle(Lookup, &DispatchContext::default()).await.unwrap();
        assert_eq!(out, "second");
    }
}
