//! Business entities that raise domain events.
//!
//! An entity mutates itself and, as part of the same operation, appends the
//! events describing that mutation to its *local event list*. The events stay
//! there until the unit of work that loaded the entity commits and the
//! [`EntityEventTracker`](crate::tracker::EntityEventTracker) drains them.

use serde::Serialize;

use meridian_core::Entity;

use crate::event::Event;
use crate::serializable::SerializableEvent;

/// Local (unpublished) events of one entity, in raise order.
///
/// Appending is public so entities can raise events; removal is reserved to
/// the tracker, which clears events only once they have been published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalEvents {
    events: Vec<SerializableEvent>,
}

impl LocalEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, event: SerializableEvent) {
        self.events.push(event);
    }

    pub fn as_slice(&self) -> &[SerializableEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop the first `count` events (already published).
    pub(crate) fn discard_published(&mut self, count: usize) {
        let count = count.min(self.events.len());
        self.events.drain(..count);
    }

    pub(crate) fn clear(&mut self) -> usize {
        let n = self.events.len();
        self.events.clear();
        n
    }
}

/// Change bookkeeping embedded in every business entity: the mutation counter
/// and the local event list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityChanges {
    mutations: u64,
    events: LocalEvents,
}

impl EntityChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a mutation that raised no event.
    pub fn record_mutation(&mut self) {
        self.mutations += 1;
    }

    /// Count a mutation and buffer the event it raised.
    pub fn record(&mut self, event: SerializableEvent) {
        self.mutations += 1;
        self.events.raise(event);
    }

    /// Serialize a typed event and record it.
    pub fn record_typed<E>(&mut self, event: &E) -> Result<(), serde_json::Error>
    where
        E: Event + Serialize,
    {
        self.record(SerializableEvent::from_typed(event)?);
        Ok(())
    }

    pub fn mutations(&self) -> u64 {
        self.mutations
    }

    pub fn events(&self) -> &LocalEvents {
        &self.events
    }

    pub(crate) fn events_mut(&mut self) -> &mut LocalEvents {
        &mut self.events
    }
}

/// An entity with identity, a mutation counter and a local event list.
///
/// Implementors embed an [`EntityChanges`] and expose it; everything else is
/// provided.
///
/// ```ignore
/// impl BusinessEntity for Order {
///     fn changes(&self) -> &EntityChanges { &self.changes }
///     fn changes_mut(&mut self) -> &mut EntityChanges { &mut self.changes }
/// }
/// ```
pub trait BusinessEntity: Entity + Send + 'static {
    fn changes(&self) -> &EntityChanges;

    fn changes_mut(&mut self) -> &mut EntityChanges;

    fn mutation_count(&self) -> u64 {
        self.changes().mutations()
    }

    fn local_events(&self) -> &[SerializableEvent] {
        self.changes().events().as_slice()
    }

    fn has_local_events(&self) -> bool {
        !self.changes().events().is_empty()
    }
}
