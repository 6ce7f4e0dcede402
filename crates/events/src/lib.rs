//! Domain events, requests and the transactional event tracker.
//!
//! - [`request`]: command/query request traits consumed by the dispatchers
//! - [`entity`]: business entities and their local (unpublished) events
//! - [`tracker`]: scope-local arena + tracker that releases local events on commit
//! - [`bus`]: event bus port; [`in_memory_bus`]: in-process implementation

pub mod bus;
pub mod entity;
pub mod event;
pub mod in_memory_bus;
pub mod request;
pub mod serializable;
pub mod tracker;

pub use bus::{EventBus, EventPublisher, PublishError, Subscription};
pub use entity::{BusinessEntity, EntityChanges, LocalEvents};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use request::{CachePolicy, Command, Query};
pub use serializable::SerializableEvent;
pub use tracker::{EmitError, EntityEventTracker, EntityHandle, TrackerPhase};
