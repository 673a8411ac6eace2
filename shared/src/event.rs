//! Protocol events and event collections
//!
//! An [`Event`] is an immutable record produced by the protocol decoder. An
//! [`EventContext`] is an ordered, uuid-deduplicated collection of events,
//! indexed by correlation key. Grouped contexts (see
//! [`EventContext::multiple`]) only exist to render human readable
//! explanations of composite expectations.

use crate::value::{ArgValue, Args};
use crate::now_ms;
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Delivery policy an event was expected with (diagnostics only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectPolicy {
    /// Only a future event can satisfy the expectation
    Wait,
    /// Point-in-time test against the last known state
    Check,
    /// Satisfied by the current state, otherwise wait for an event
    CheckWait,
}

impl fmt::Display for ExpectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectPolicy::Wait => write!(f, "wait"),
            ExpectPolicy::Check => write!(f, "check"),
            ExpectPolicy::CheckWait => write!(f, "check_wait"),
        }
    }
}

/// Correlation key used to group related events
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKey {
    /// Default key: the event's own identity
    Uuid(Uuid),
    /// Application defined key, e.g. a message name or a (media, resource) pair
    Parts(Vec<String>),
}

impl EventKey {
    /// Key made of a single name
    pub fn named(name: impl Into<String>) -> Self {
        EventKey::Parts(vec![name.into()])
    }

    /// Key made of two parts, e.g. `(media_id, resource_id)`
    pub fn pair(first: impl Into<String>, second: impl Into<String>) -> Self {
        EventKey::Parts(vec![first.into(), second.into()])
    }
}

impl From<&str> for EventKey {
    fn from(name: &str) -> Self {
        EventKey::named(name)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Uuid(uuid) => write!(f, "{}", uuid),
            EventKey::Parts(parts) => write!(f, "{}", parts.join("/")),
        }
    }
}

/// An immutable protocol occurrence
#[derive(Debug, Clone)]
pub struct Event {
    uuid: Uuid,
    id: EventKey,
    timestamp_ms: u64,
    policy: Option<ExpectPolicy>,
    message: String,
    args: Args,
}

impl Event {
    /// Create a new event for `message`; its correlation key defaults to its uuid
    pub fn new(message: impl Into<String>, args: Args) -> Self {
        let uuid = Uuid::new_v4();
        Self {
            uuid,
            id: EventKey::Uuid(uuid),
            timestamp_ms: now_ms(),
            policy: None,
            message: message.into(),
            args,
        }
    }

    /// Create an event correlated by its message name
    pub fn message(message: impl Into<String>, args: Args) -> Self {
        let message = message.into();
        Self::new(message.clone(), args).with_key(EventKey::named(message))
    }

    /// Override the correlation key
    pub fn with_key(mut self, id: EventKey) -> Self {
        self.id = id;
        self
    }

    /// Tag the event with the delivery policy it was expected with
    pub fn with_policy(mut self, policy: ExpectPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Correlation key
    pub fn id(&self) -> &EventKey {
        &self.id
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn policy(&self) -> Option<ExpectPolicy> {
        self.policy
    }

    pub fn name(&self) -> &str {
        &self.message
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn arg(&self, name: &str) -> Option<&ArgValue> {
        self.args.get(name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.message)?;
        let mut first = true;
        for (name, value) in &self.args {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}={}", name, value)?;
        }
        if let Some(policy) = self.policy {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "_policy='{}'", policy)?;
        }
        write!(f, ")")
    }
}

/// How an event was involved in an expectation, used in explanations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMarker {
    Matched,
    Unmatched,
    Ignored,
}

impl EventMarker {
    fn prefix(&self) -> &'static str {
        match self {
            EventMarker::Matched => "[x]",
            EventMarker::Unmatched => "[ ]",
            EventMarker::Ignored => "[~]",
        }
    }
}

/// The way child expectations are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Combine {
    /// Every child must match (`&`)
    All,
    /// The first matching child wins (`|`)
    Any,
    /// Children must match in order (`>>`)
    Sequence,
}

impl Combine {
    pub fn symbol(&self) -> &'static str {
        match self {
            Combine::All => "&",
            Combine::Any => "|",
            Combine::Sequence => ">>",
        }
    }
}

#[derive(Debug, Clone)]
struct Group {
    contexts: Vec<EventContext>,
    combine: Combine,
}

/// Ordered, uuid-deduplicated collection of events
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    events: Vec<Event>,
    uuids: HashSet<Uuid>,
    by_key: HashMap<EventKey, Vec<usize>>,
    marker: Option<EventMarker>,
    group: Option<Group>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a list of events, dropping uuid duplicates
    pub fn from_events(events: impl IntoIterator<Item = Event>) -> Self {
        let mut ctx = Self::new();
        for event in events {
            ctx.push(event);
        }
        ctx
    }

    /// Same as [`EventContext::from_events`] with every event tagged with `policy`
    pub fn with_policy(events: impl IntoIterator<Item = Event>, policy: ExpectPolicy) -> Self {
        Self::from_events(events.into_iter().map(|e| e.with_policy(policy)))
    }

    /// Aggregate child contexts under a combinator label
    ///
    /// The flattened events of every child are available through the usual
    /// accessors, the grouping only affects the `Display` output.
    pub fn multiple(contexts: Vec<EventContext>, combine: Combine) -> Self {
        let mut ctx = Self::from_events(
            contexts
                .iter()
                .flat_map(|c| c.events().iter().cloned())
                .collect::<Vec<_>>(),
        );
        ctx.group = Some(Group { contexts, combine });
        ctx
    }

    /// Append an event; returns false if an event with the same uuid is already present
    pub fn push(&mut self, event: Event) -> bool {
        if !self.uuids.insert(event.uuid()) {
            return false;
        }
        self.by_key
            .entry(event.id().clone())
            .or_default()
            .push(self.events.len());
        self.events.push(event);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Most recent event of the collection
    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Most recent event for a correlation key
    pub fn last_for(&self, key: &EventKey) -> Option<&Event> {
        self.by_key
            .get(key)
            .and_then(|indexes| indexes.last())
            .map(|&i| &self.events[i])
    }

    /// All events for a correlation key, in insertion order
    pub fn filter(&self, key: &EventKey) -> EventContext {
        let mut ctx = match self.by_key.get(key) {
            Some(indexes) => Self::from_events(indexes.iter().map(|&i| self.events[i].clone())),
            None => Self::new(),
        };
        ctx.marker = self.marker;
        ctx
    }

    /// Child contexts of a grouped context, empty ones excluded
    pub fn contexts(&self) -> Vec<&EventContext> {
        match &self.group {
            Some(group) => group.contexts.iter().filter(|c| !c.is_empty()).collect(),
            None => Vec::new(),
        }
    }

    pub fn combine(&self) -> Option<Combine> {
        self.group.as_ref().map(|g| g.combine)
    }

    pub fn marker(&self) -> Option<EventMarker> {
        self.marker
    }

    /// Set the explanation marker, recursively for grouped contexts
    pub fn with_marker(mut self, marker: EventMarker) -> Self {
        self.set_marker(marker);
        self
    }

    fn set_marker(&mut self, marker: EventMarker) {
        self.marker = Some(marker);
        if let Some(group) = &mut self.group {
            for ctx in &mut group.contexts {
                ctx.set_marker(marker);
            }
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(group) = &self.group {
            let contexts: Vec<_> = group.contexts.iter().filter(|c| !c.is_empty()).collect();
            return match contexts.len() {
                0 => Ok(()),
                1 => contexts[0].render(f),
                _ => {
                    write!(f, "( ")?;
                    for (i, ctx) in contexts.iter().enumerate() {
                        if i > 0 {
                            write!(f, " {} ", group.combine.symbol())?;
                        }
                        ctx.render(f)?;
                    }
                    write!(f, " )")
                }
            };
        }

        let prefix = self.marker.map(|m| m.prefix()).unwrap_or("");
        if self.events.len() > 1 {
            write!(f, "[")?;
        }
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}{}", prefix, event)?;
        }
        if self.events.len() > 1 {
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl fmt::Display for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f)
    }
}

impl<'a> IntoIterator for &'a EventContext {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

impl FromIterator<Event> for EventContext {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        Self::from_events(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    #[test]
    fn test_event_key_defaults_to_uuid() {
        let event = Event::new("Ack", args! {});
        assert_eq!(event.id(), &EventKey::Uuid(event.uuid()));

        let keyed = Event::new("Media", args! {}).with_key(EventKey::pair("m1", "r1"));
        assert_eq!(keyed.id().to_string(), "m1/r1");
    }

    #[test]
    fn test_context_deduplicates_by_uuid() {
        let event = Event::message("FlyingState", args! { "state" => "landed" });
        let mut ctx = EventContext::new();
        assert!(ctx.push(event.clone()));
        assert!(!ctx.push(event));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_last_for_key() {
        let ctx = EventContext::from_events(vec![
            Event::message("FlyingState", args! { "state" => "takingoff" }),
            Event::message("Battery", args! { "percent" => 80 }),
            Event::message("FlyingState", args! { "state" => "hovering" }),
        ]);

        let last = ctx.last_for(&EventKey::named("FlyingState")).unwrap();
        assert_eq!(last.arg("state"), Some(&ArgValue::from("hovering")));
        assert_eq!(ctx.filter(&EventKey::named("FlyingState")).len(), 2);
        assert!(ctx.filter(&EventKey::named("Gps")).is_empty());
        assert_eq!(ctx.last().unwrap().name(), "FlyingState");
    }

    #[test]
    fn test_multiple_context_display() {
        let a = EventContext::from_events(vec![Event::message("Ack", args! { "cmd" => "takeoff" })])
            .with_marker(EventMarker::Matched);
        let b = EventContext::from_events(vec![Event::message(
            "FlyingState",
            args! { "state" => "hovering" },
        )])
        .with_marker(EventMarker::Unmatched);

        let both = EventContext::multiple(vec![a, b, EventContext::new()], Combine::All);
        assert_eq!(both.len(), 2);
        assert_eq!(both.contexts().len(), 2);
        assert_eq!(
            both.to_string(),
            "( [x]Ack(cmd='takeoff') & [ ]FlyingState(state='hovering') )"
        );
    }

    #[test]
    fn test_policy_tag_display() {
        let ctx = EventContext::with_policy(
            vec![Event::message("FlyingState", args! { "state" => "hovering" })],
            ExpectPolicy::CheckWait,
        );
        assert_eq!(
            ctx.to_string(),
            "FlyingState(state='hovering', _policy='check_wait')"
        );
    }
}
