//! Named contexts consulted at schedule time
//!
//! A context is a capability object registered on a scheduler under a name.
//! It can veto scheduling through its schedule hook, observe every event
//! before expectations do, and expose domain capabilities (sending commands,
//! answering state queries) to the expectations that need them.

use crate::command::{AckStatus, CommandMessage};
use crate::expectation::Expectation;
use crate::runtime::{lock, Completion};
use skyctl_shared::{Event, EventKey};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Capability object registered on a scheduler
pub trait Context: Send + Sync + 'static {
    /// Return a pre-resolved expectation to veto scheduling
    fn schedule_hook(&self, expectation: &Expectation) -> Option<Expectation> {
        let _ = expectation;
        None
    }

    /// Called on the scheduler loop for every event, before pending
    /// expectations are checked
    fn observe(&self, event: &Event) {
        let _ = event;
    }

    fn command_sender(&self) -> Option<&dyn CommandSender> {
        None
    }

    fn state_query(&self) -> Option<&dyn StateQuery> {
        None
    }
}

/// Sends commands to the device
pub trait CommandSender: Send + Sync {
    /// Send `command`; the completion resolves with the device acknowledgement
    ///
    /// Must not block.
    fn send_command(&self, command: &CommandMessage) -> anyhow::Result<Completion<AckStatus>>;
}

/// Answers "what is the last known event for this key"
pub trait StateQuery: Send + Sync {
    fn last_event(&self, key: &EventKey) -> Option<Event>;
}

/// Ordered registry of named contexts
#[derive(Default)]
pub struct ContextRegistry {
    entries: Mutex<Vec<(String, Arc<dyn Context>)>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `context` under `name`
    ///
    /// Replacing an existing name keeps its position in the hook order.
    pub fn insert(&self, name: impl Into<String>, context: Arc<dyn Context>) -> Option<Arc<dyn Context>> {
        let name = name.into();
        let mut entries = lock(&self.entries);
        match entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, context)),
            None => {
                entries.push((name, context));
                None
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Context>> {
        let mut entries = lock(&self.entries);
        let index = entries.iter().position(|(n, _)| n == name)?;
        Some(entries.remove(index).1)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Context>> {
        lock(&self.entries)
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, context)| context.clone())
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.entries).iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Context>)> {
        lock(&self.entries).clone()
    }

    /// Run every schedule hook in registration order; the first veto wins
    ///
    /// Hooks see the expectation first, then each of its children depth
    /// first, so a group cannot hide a leaf from a veto. A panicking hook is
    /// logged and skipped.
    pub(crate) fn run_hooks(&self, expectation: &Expectation) -> Option<Expectation> {
        let contexts = self.snapshot();
        if contexts.is_empty() {
            return None;
        }
        Self::run_hooks_on(&contexts, expectation)
    }

    fn run_hooks_on(
        contexts: &[(String, Arc<dyn Context>)],
        expectation: &Expectation,
    ) -> Option<Expectation> {
        for (name, context) in contexts {
            match catch_unwind(AssertUnwindSafe(|| context.schedule_hook(expectation))) {
                Ok(Some(veto)) => return Some(veto),
                Ok(None) => {}
                Err(_) => error!(context = %name, "Schedule hook panicked"),
            }
        }
        expectation
            .children()
            .iter()
            .find_map(|child| Self::run_hooks_on(contexts, child))
    }

    pub(crate) fn observe(&self, event: &Event) {
        for (name, context) in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| context.observe(event))).is_err() {
                error!(context = %name, event = %event, "Context observer panicked");
            }
        }
    }

    /// Send through the first context able to; None if none can
    pub fn send_command(
        &self,
        command: &CommandMessage,
    ) -> Option<anyhow::Result<Completion<AckStatus>>> {
        self.snapshot().into_iter().find_map(|(_, context)| {
            context
                .command_sender()
                .map(|sender| sender.send_command(command))
        })
    }

    /// Whether some context answers state queries
    pub fn has_state(&self) -> bool {
        self.snapshot()
            .iter()
            .any(|(_, context)| context.state_query().is_some())
    }

    /// Last known event for `key`, from the first context that knows it
    pub fn last_event(&self, key: &EventKey) -> Option<Event> {
        self.snapshot().into_iter().find_map(|(_, context)| {
            context.state_query().and_then(|query| query.last_event(key))
        })
    }
}
