//! Scope-local entity arena and transactional event tracker.
//!
//! Entities loaded or created inside a unit of work are *attached* to the
//! tracker's arena and addressed through typed [`EntityHandle`]s. The tracker
//! never hands out long-lived references: callers mutate an entity through a
//! closure, then register it with [`EntityEventTracker::add_entity`] if the
//! mutation raised events. When the unit of work commits, the caller drains
//! the tracker with [`EntityEventTracker::emit_transactional_events`].
//!
//! ## Drain semantics
//!
//! ```text
//! for entity in tracked (insertion order):
//!     for event in entity.local_events (raise order):
//!         publish(event)?
//!     clear entity.local_events; untrack entity
//! ```
//!
//! A publish failure stops the drain. Entities fully emitted before the
//! failure stay cleared; the failing entity keeps only its unpublished events
//! and stays tracked with every entity after it, so a retry neither loses nor
//! republishes anything.

use core::any::Any;
use core::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use meridian_core::EntityKey;

use crate::bus::{EventPublisher, PublishError};
use crate::entity::{BusinessEntity, EntityChanges};
use crate::event::Event;
use crate::serializable::SerializableEvent;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Typed index of an entity attached to one tracker's arena.
pub struct EntityHandle<T> {
    arena: u64,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> EntityHandle<T> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for EntityHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for EntityHandle<T> {}

impl<T> PartialEq for EntityHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.arena == other.arena && self.index == other.index
    }
}

impl<T> Eq for EntityHandle<T> {}

impl<T> core::fmt::Debug for EntityHandle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("arena", &self.arena)
            .field("index", &self.index)
            .finish()
    }
}

/// Lifecycle phase of a tracker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrackerPhase {
    /// Nothing tracked.
    Idle,
    /// At least one entity with pending events is tracked.
    Accumulating,
    /// A drain is in progress.
    Draining,
}

/// Drain failure.
#[derive(Debug, Error)]
pub enum EmitError {
    /// Publishing an event of `entity` failed; `published` events were
    /// emitted by this drain before the failure.
    #[error("publishing events of entity '{entity}' failed after {published} event(s): {source}")]
    Publish {
        entity: EntityKey,
        published: usize,
        #[source]
        source: PublishError,
    },

    #[error("event emission cancelled after {published} event(s)")]
    Cancelled { published: usize },

    #[error("a drain is already in progress")]
    AlreadyDraining,
}

/// Type-erased arena slot.
trait Slot: Send {
    fn key(&self) -> EntityKey;
    fn changes(&self) -> &EntityChanges;
    fn changes_mut(&mut self) -> &mut EntityChanges;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: BusinessEntity> Slot for T {
    fn key(&self) -> EntityKey {
        meridian_core::Entity::key(self)
    }

    fn changes(&self) -> &EntityChanges {
        BusinessEntity::changes(self)
    }

    fn changes_mut(&mut self) -> &mut EntityChanges {
        BusinessEntity::changes_mut(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Default)]
struct TrackerState {
    slots: Vec<Option<Box<dyn Slot>>>,
    /// Arena indices with pending events, in tracking order, no duplicates.
    tracked: Vec<usize>,
    draining: bool,
}

impl TrackerState {
    fn slot<T: BusinessEntity>(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()?.as_any().downcast_ref::<T>()
    }

    fn slot_mut<T: BusinessEntity>(&mut self, index: usize) -> Option<&mut T> {
        self.slots
            .get_mut(index)?
            .as_mut()?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    fn untrack(&mut self, index: usize) {
        self.tracked.retain(|&i| i != index);
    }
}

/// Scope-local registry of entities holding unemitted local events.
///
/// All operations take `&self` and are safe to call concurrently; the tracked
/// set and the arena are guarded by one mutex that is never held across an
/// `.await`.
pub struct EntityEventTracker {
    arena: u64,
    state: Mutex<TrackerState>,
}

impl Default for EntityEventTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EntityEventTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("EntityEventTracker")
            .field("arena", &self.arena)
            .field("entities", &state.slots.iter().filter(|s| s.is_some()).count())
            .field("tracked", &state.tracked)
            .field("draining", &state.draining)
            .finish()
    }
}

impl EntityEventTracker {
    pub fn new() -> Self {
        Self {
            arena: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // Arena state stays structurally valid even if a caller's closure panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owns<T>(&self, handle: &EntityHandle<T>) -> bool {
        handle.arena == self.arena
    }

    /// Move an entity into the arena.
    pub fn attach<T: BusinessEntity>(&self, entity: T) -> EntityHandle<T> {
        let mut state = self.lock();
        let index = state.slots.len();
        state.slots.push(Some(Box::new(entity)));
        EntityHandle {
            arena: self.arena,
            index,
            _marker: PhantomData,
        }
    }

    /// Read an attached entity.
    pub fn with_entity<T, R>(&self, handle: &EntityHandle<T>, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: BusinessEntity,
    {
        if !self.owns(handle) {
            return None;
        }
        let state = self.lock();
        state.slot::<T>(handle.index).map(f)
    }

    /// Mutate an attached entity. Events it raises are not tracked until
    /// [`add_entity`](Self::add_entity) is called.
    pub fn with_entity_mut<T, R>(
        &self,
        handle: &EntityHandle<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R>
    where
        T: BusinessEntity,
    {
        if !self.owns(handle) {
            return None;
        }
        let mut state = self.lock();
        state.slot_mut::<T>(handle.index).map(f)
    }

    /// Take an entity out of the arena (it is untracked; pending events travel with it).
    pub fn detach<T: BusinessEntity>(&self, handle: EntityHandle<T>) -> Option<T> {
        if !self.owns(&handle) {
            return None;
        }
        let mut state = self.lock();
        let slot = state.slots.get_mut(handle.index)?;
        if !slot.as_ref()?.as_any().is::<T>() {
            return None;
        }
        let boxed = slot.take()?;
        state.untrack(handle.index);
        boxed.into_any().downcast::<T>().ok().map(|b| *b)
    }

    /// Register an entity that raised events.
    ///
    /// Returns `true` if the entity became tracked by this call. Redundant
    /// calls (already tracked, no local events, stale or foreign handle) are
    /// no-ops returning `false`.
    pub fn add_entity<T: BusinessEntity>(&self, handle: &EntityHandle<T>) -> bool {
        if !self.owns(handle) {
            return false;
        }
        let mut state = self.lock();
        let has_events = match state.slot::<T>(handle.index) {
            Some(entity) => entity.has_local_events(),
            None => return false,
        };
        if !has_events || state.tracked.contains(&handle.index) {
            return false;
        }
        state.tracked.push(handle.index);
        true
    }

    pub fn is_tracked<T>(&self, handle: &EntityHandle<T>) -> bool {
        self.owns(handle) && self.lock().tracked.contains(&handle.index)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().tracked.len()
    }

    /// Number of unemitted events across tracked entities.
    pub fn pending_event_count(&self) -> usize {
        let state = self.lock();
        state
            .tracked
            .iter()
            .filter_map(|&i| state.slots.get(i)?.as_ref())
            .map(|s| s.changes().events().len())
            .sum()
    }

    pub fn phase(&self) -> TrackerPhase {
        let state = self.lock();
        if state.draining {
            TrackerPhase::Draining
        } else if state.tracked.is_empty() {
            TrackerPhase::Idle
        } else {
            TrackerPhase::Accumulating
        }
    }

    /// Drop every pending event of tracked entities without publishing.
    ///
    /// Used when the owning unit of work is rolled back. Returns the number of
    /// discarded events.
    pub fn discard_pending(&self) -> usize {
        let mut state = self.lock();
        let tracked = std::mem::take(&mut state.tracked);
        let mut discarded = 0;
        for index in tracked {
            if let Some(Some(slot)) = state.slots.get_mut(index) {
                discarded += slot.changes_mut().events_mut().clear();
            }
        }
        if discarded > 0 {
            debug!(arena = self.arena, discarded, "discarded pending entity events");
        }
        discarded
    }

    /// Publish every pending event of every tracked entity, then clear them.
    ///
    /// Returns the number of events published. Calling this with nothing
    /// tracked succeeds and publishes nothing.
    pub async fn emit_transactional_events<P>(
        &self,
        publisher: &P,
        cancel: &CancellationToken,
    ) -> Result<usize, EmitError>
    where
        P: EventPublisher + ?Sized,
    {
        let _guard = {
            let mut state = self.lock();
            if state.draining {
                return Err(EmitError::AlreadyDraining);
            }
            if state.tracked.is_empty() {
                return Ok(0);
            }
            state.draining = true;
            DrainGuard { tracker: self }
        };

        let mut published = 0usize;

        while let Some((index, key, events)) = self.next_pending() {
            let mut emitted = 0usize;
            for event in &events {
                if cancel.is_cancelled() {
                    self.settle(index, emitted);
                    warn!(arena = self.arena, published, "event emission cancelled");
                    return Err(EmitError::Cancelled { published });
                }
                if let Err(source) = publisher.publish_event(event.clone()).await {
                    self.settle(index, emitted);
                    warn!(
                        arena = self.arena,
                        entity = %key,
                        event_type = event.event_type(),
                        error = %source,
                        "event publication failed"
                    );
                    return Err(EmitError::Publish {
                        entity: key,
                        published,
                        source,
                    });
                }
                emitted += 1;
                published += 1;
            }
            self.settle(index, emitted);
        }

        debug!(arena = self.arena, published, "emitted transactional events");
        Ok(published)
    }

    /// Snapshot of the first tracked entity's pending events.
    fn next_pending(&self) -> Option<(usize, EntityKey, Vec<SerializableEvent>)> {
        let mut state = self.lock();
        loop {
            let index = *state.tracked.first()?;
            match state.slots.get(index).and_then(Option::as_ref) {
                Some(slot) if !slot.changes().events().is_empty() => {
                    return Some((index, slot.key(), slot.changes().events().as_slice().to_vec()));
                }
                _ => state.untrack(index),
            }
        }
    }

    /// Remove the `emitted` published events of entity `index`; untrack it
    /// once it has nothing left.
    fn settle(&self, index: usize, emitted: usize) {
        let mut state = self.lock();
        let remaining = match state.slots.get_mut(index).and_then(Option::as_mut) {
            Some(slot) => {
                let events = slot.changes_mut().events_mut();
                events.discard_published(emitted);
                events.len()
            }
            None => 0,
        };
        if remaining == 0 {
            state.untrack(index);
        }
    }
}

/// Resets the draining flag however the drain ends (including the future being dropped).
struct DrainGuard<'a> {
    tracker: &'a EntityEventTracker,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.tracker.lock().draining = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;

    use meridian_core::{Entity, EntityId};

    use super::*;
    use crate::bus::EventBus;
    use crate::in_memory_bus::InMemoryEventBus;

    #[derive(Debug)]
    struct Order {
        id: EntityId,
        lines: u32,
        changes: EntityChanges,
    }

    impl Order {
        fn new() -> Self {
            Self {
                id: EntityId::new(),
                lines: 0,
                changes: EntityChanges::new(),
            }
        }

        fn add_line(&mut self) {
            self.lines += 1;
            let event = SerializableEvent::new(
                format!("orders.line.added.{}", self.lines),
                json!({ "line": self.lines }),
            )
            .with_source(self.id.to_string());
            self.changes.record(event);
        }
    }

    impl Entity for Order {
        type Id = EntityId;

        fn id(&self) -> &Self::Id {
            &self.id
        }

        fn key(&self) -> EntityKey {
            EntityKey::single(self.id)
        }
    }

    impl BusinessEntity for Order {
        fn changes(&self) -> &EntityChanges {
            &self.changes
        }

        fn changes_mut(&mut self) -> &mut EntityChanges {
            &mut self.changes
        }
    }

    /// Records every event and fails the n-th publish (1-based), if configured.
    #[derive(Default)]
    struct RecordingPublisher {
        published: StdMutex<Vec<String>>,
        fail_on: Option<usize>,
        attempts: StdMutex<usize>,
    }

    impl RecordingPublisher {
        fn failing_on(n: usize) -> Self {
            Self {
                fail_on: Some(n),
                ..Self::default()
            }
        }

        fn published(&self) -> Vec<String> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish_event(&self, event: SerializableEvent) -> Result<(), PublishError> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts += 1;
                *attempts
            };
            if self.fail_on == Some(attempt) {
                return Err(PublishError::new("broker unavailable"));
            }
            self.published
                .lock()
                .unwrap()
                .push(event.event_type().to_string());
            Ok(())
        }
    }

    fn order_with_lines(tracker: &EntityEventTracker, lines: u32) -> EntityHandle<Order> {
        let handle = tracker.attach(Order::new());
        tracker
            .with_entity_mut(&handle, |o| (0..lines).for_each(|_| o.add_line()))
            .unwrap();
        handle
    }

    #[test]
    fn adding_the_same_entity_twice_tracks_it_once() {
        let tracker = EntityEventTracker::new();
        let handle = order_with_lines(&tracker, 1);

        assert!(tracker.add_entity(&handle));
        assert!(!tracker.add_entity(&handle));
        assert_eq!(tracker.tracked_count(), 1);
        assert_eq!(tracker.phase(), TrackerPhase::Accumulating);
    }

    #[test]
    fn entities_without_events_are_not_tracked() {
        let tracker = EntityEventTracker::new();
        let handle = tracker.attach(Order::new());

        assert!(!tracker.add_entity(&handle));
        assert_eq!(tracker.phase(), TrackerPhase::Idle);
    }

    #[test]
    fn handles_from_another_tracker_are_rejected() {
        let a = EntityEventTracker::new();
        let b = EntityEventTracker::new();
        let handle = order_with_lines(&a, 1);

        assert!(!b.add_entity(&handle));
        assert!(b.with_entity(&handle, |o| o.lines).is_none());
    }

    #[tokio::test]
    async fn drain_publishes_in_raise_order_and_clears_local_events() {
        let tracker = EntityEventTracker::new();
        let handle = order_with_lines(&tracker, 3);
        tracker.add_entity(&handle);
        let publisher = RecordingPublisher::default();

        let published = tracker
            .emit_transactional_events(&publisher, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(published, 3);
        assert_eq!(
            publisher.published(),
            vec!["orders.line.added.1", "orders.line.added.2", "orders.line.added.3"]
        );
        assert_eq!(tracker.with_entity(&handle, |o| o.local_events().len()), Some(0));
        assert_eq!(tracker.phase(), TrackerPhase::Idle);

        let again = tracker
            .emit_transactional_events(&publisher, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(publisher.published().len(), 3);
    }

    #[tokio::test]
    async fn drain_follows_tracking_order_across_entities() {
        let tracker = EntityEventTracker::new();
        let first = order_with_lines(&tracker, 1);
        let second = order_with_lines(&tracker, 2);
        tracker.add_entity(&second);
        tracker.add_entity(&first);
        let publisher = RecordingPublisher::default();

        tracker
            .emit_transactional_events(&publisher, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            publisher.published(),
            vec!["orders.line.added.1", "orders.line.added.2", "orders.line.added.1"]
        );
    }

    #[tokio::test]
    async fn publish_failure_keeps_unpublished_events_and_never_republishes() {
        let tracker = EntityEventTracker::new();
        let first = order_with_lines(&tracker, 1);
        let second = order_with_lines(&tracker, 3);
        tracker.add_entity(&first);
        tracker.add_entity(&second);

        // first: 1 ok; second: 1 ok, then failure on its 2nd event.
        let publisher = RecordingPublisher::failing_on(3);
        let err = tracker
            .emit_transactional_events(&publisher, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            EmitError::Publish { published, .. } => assert_eq!(published, 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!tracker.is_tracked(&first));
        assert_eq!(tracker.with_entity(&first, |o| o.local_events().len()), Some(0));
        assert!(tracker.is_tracked(&second));
        assert_eq!(tracker.with_entity(&second, |o| o.local_events().len()), Some(2));

        // Retry publishes only what is left.
        let retry = RecordingPublisher::default();
        let published = tracker
            .emit_transactional_events(&retry, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(published, 2);
        assert_eq!(retry.published(), vec!["orders.line.added.2", "orders.line.added.3"]);
    }

    #[tokio::test]
    async fn cancelled_drain_publishes_nothing_and_keeps_events() {
        let tracker = EntityEventTracker::new();
        let handle = order_with_lines(&tracker, 2);
        tracker.add_entity(&handle);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = tracker
            .emit_transactional_events(&RecordingPublisher::default(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, EmitError::Cancelled { published: 0 }));
        assert_eq!(tracker.pending_event_count(), 2);
        assert_eq!(tracker.phase(), TrackerPhase::Accumulating);
    }

    #[tokio::test]
    async fn drains_into_the_in_memory_bus() {
        let tracker = EntityEventTracker::new();
        let handle = order_with_lines(&tracker, 2);
        tracker.add_entity(&handle);
        let bus = Arc::new(InMemoryEventBus::<SerializableEvent>::new());
        let sub = bus.subscribe();

        tracker
            .emit_transactional_events(bus.as_ref(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sub.drain().len(), 2);
    }

    #[test]
    fn discard_pending_drops_events_without_publishing() {
        let tracker = EntityEventTracker::new();
        let handle = order_with_lines(&tracker, 2);
        tracker.add_entity(&handle);

        assert_eq!(tracker.discard_pending(), 2);
        assert_eq!(tracker.tracked_count(), 0);
        assert_eq!(tracker.with_entity(&handle, |o| o.local_events().len()), Some(0));
    }

    #[test]
    fn detach_returns_the_entity_and_untracks_it() {
        let tracker = EntityEventTracker::new();
        let handle = order_with_lines(&tracker, 1);
        tracker.add_entity(&handle);

        let order = tracker.detach(handle).unwrap();

        assert_eq!(order.lines, 1);
        assert_eq!(tracker.tracked_count(), 0);
        assert!(tracker.detach(handle).is_none());
    }

    #[test]
    fn concurrent_add_entity_tracks_each_entity_once() {
        let tracker = Arc::new(EntityEventTracker::new());
        let handles: Vec<_> = (0..8).map(|_| order_with_lines(&tracker, 1)).collect();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                let handles = handles.clone();
                std::thread::spawn(move || {
                    for h in &handles {
                        tracker.add_entity(h);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(tracker.tracked_count(), 8);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: the tracked set never holds duplicates, whatever the call sequence.
        #[test]
        fn tracked_set_has_set_semantics(calls in prop::collection::vec(0usize..5, 0..40)) {
            let tracker = EntityEventTracker::new();
            let handles: Vec<_> = (0..5).map(|_| order_with_lines(&tracker, 1)).collect();

            let mut distinct = std::collections::BTreeSet::new();
            for i in calls {
                tracker.add_entity(&handles[i]);
                distinct.insert(i);
            }

            prop_assert_eq!(tracker.tracked_count(), distinct.len());
        }
    }
}
