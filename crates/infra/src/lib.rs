//! Infrastructure layer: dispatch pipeline, transaction scopes, persistence
//! sessions, caching, config.
//!
//! ```text
//! caller ─▶ CommandDispatcher / QueryDispatcher
//!             ├─ HandlerRegistry      (resolve_exactly_one / resolve_required_single)
//!             ├─ ValidationPipeline   (when enabled)
//!             ├─ CachePort            (queries with a cache policy, when enabled)
//!             └─ handler(request, DispatchContext { scope?, cancel })
//!                   └─ Repository ─▶ SessionResolver ─▶ scope's SessionRegistry
//! caller ─▶ TransactionScope::complete ─▶ flush sessions ─▶ emit tracked events
//! ```

pub mod cache;
pub mod command_dispatcher;
pub mod config;
pub mod context;
pub mod error;
pub mod handler_registry;
pub mod persistence;
pub mod query_dispatcher;
pub mod repository;
pub mod transaction;
pub mod validation;


pub use cache::{CacheError, CachePort, CacheStats, InMemoryCache};
pub use command_dispatcher::CommandDispatcher;
pub use config::{ConfigError, DispatchOptions, SharedOptions};
pub use context::DispatchContext;
pub use error::DispatchError;
pub use handler_registry::{CommandHandler, HandlerRegistry, QueryHandler};
pub use persistence::{PersistenceError, SessionError, SessionFactories, SessionResolver};
pub use query_dispatcher::QueryDispatcher;
pub use repository::Repository;
pub use transaction::{CompletionReport, TransactionContext, TransactionError, TransactionScope};
pub use validation::{FnValidator, ValidationPipeline, Validator};
