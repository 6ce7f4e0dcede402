//! Transaction-scoped persistence sessions.
//!
//! This module defines the ORM-agnostic session boundary and the registry
//! that guarantees one session per named store per transaction scope.
//!
//! ```text
//! Repository ──resolve(scope?, "Orders")──▶ SessionResolver
//!                                             ├─ no scope: ad-hoc session (caller flushes + disposes)
//!                                             └─ scope:    SessionRegistry::get_or_open (one per store)
//! ```

pub mod error;
pub mod factory;
pub mod in_memory;
pub mod registry;
pub mod session;

pub use error::{PersistenceError, SessionError};
pub use factory::{SessionFactories, SessionFactory};
pub use in_memory::{InMemoryDataStore, InMemorySession, InMemorySessionFactory, RECENT_SESSIONS};
pub use registry::{ResolvedSession, SessionRegistry, SessionResolver};
pub use session::{PendingWrite, PersistenceSession, RecordKey};
