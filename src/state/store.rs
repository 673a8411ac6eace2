//! Last event per correlation key

use crate::scheduler::{Context, StateQuery};
use skyctl_shared::{Event, EventContext, EventKey};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::trace;

/// Keeps the most recent event for every correlation key
///
/// An event is recorded under its own key and, when that key is not already
/// its message name, under its message name as well, so states can be looked
/// up either way.
#[derive(Debug, Default)]
pub struct StateStore {
    /// Latest event per key
    events: RwLock<HashMap<EventKey, Event>>,
}

impl StateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event` as the latest state for its keys
    pub fn record(&self, event: Event) {
        let named = EventKey::named(event.name());
        let mut events = match self.events.write() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        trace!(key = %event.id(), event = %event, "State recorded");
        if *event.id() != named {
            events.insert(named, event.clone());
        }
        events.insert(event.id().clone(), event);
    }

    /// Latest event recorded for `key`
    pub fn last(&self, key: &EventKey) -> Option<Event> {
        self.read(|events| events.get(key).cloned())
    }

    /// Number of keys with a recorded state
    pub fn len(&self) -> usize {
        self.read(|events| events.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every recorded state, e.g. after a disconnection
    pub fn clear(&self) {
        match self.events.write() {
            Ok(mut events) => events.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// All distinct recorded events, oldest first
    pub fn snapshot(&self) -> EventContext {
        let mut events: Vec<Event> = self.read(|events| events.values().cloned().collect());
        events.sort_by_key(|event| event.timestamp_ms());
        EventContext::from_events(events)
    }

    fn read<R>(&self, f: impl FnOnce(&HashMap<EventKey, Event>) -> R) -> R {
        match self.events.read() {
            Ok(events) => f(&events),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl StateQuery for StateStore {
    fn last_event(&self, key: &EventKey) -> Option<Event> {
        self.last(key)
    }
}

impl Context for StateStore {
    fn observe(&self, event: &Event) {
        self.record(event.clone());
    }

    fn state_query(&self) -> Option<&dyn StateQuery> {
        Some(self)
    }
}
