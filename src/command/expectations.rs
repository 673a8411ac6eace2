//! Event and state expectations
//!
//! [`EventExpectation`] waits for a future event; [`StateExpectation`]
//! checks the last known state at schedule time and never waits. [`expect`]
//! builds one or the other (or both, as a check-then-wait) from a policy.

use crate::expectation::{Expectation, Matcher, Verdict};
use crate::scheduler::Scheduler;
use skyctl_shared::{
    defaults, match_args, Args, Event, EventContext, EventKey, ExpectPolicy,
};
use tracing::debug;

/// Waits for an event with the given message and (a subset of) arguments
#[derive(Debug, Clone)]
pub struct EventExpectation {
    message: String,
    expected: Args,
    float_tol: f64,
    received: Vec<Event>,
    matched: Option<Event>,
}

impl EventExpectation {
    pub fn new(message: impl Into<String>, expected: Args) -> Self {
        Self {
            message: message.into(),
            expected,
            float_tol: defaults::FLOAT_TOLERANCE,
            received: Vec::new(),
            matched: None,
        }
    }

    /// Absolute tolerance used to compare float arguments
    pub fn float_tol(mut self, float_tol: f64) -> Self {
        self.float_tol = float_tol;
        self
    }

    fn expected_event(&self) -> Event {
        Event::message(self.message.clone(), self.expected.clone()).with_policy(ExpectPolicy::Wait)
    }
}

impl Matcher for EventExpectation {
    fn check(&mut self, event: &Event) -> Verdict {
        if event.name() != self.message {
            return Verdict::Pending;
        }
        self.received.push(event.clone());
        if match_args(event.args(), &self.expected, self.float_tol) {
            self.matched = Some(event.clone());
            Verdict::Matched
        } else {
            Verdict::Pending
        }
    }

    fn expected(&self) -> EventContext {
        EventContext::from_events([self.expected_event()])
    }

    fn matched(&self) -> EventContext {
        self.matched.iter().cloned().collect()
    }

    fn unmatched(&self) -> EventContext {
        match self.matched {
            Some(_) => EventContext::new(),
            None => self.expected(),
        }
    }

    fn received(&self) -> EventContext {
        self.received.iter().cloned().collect()
    }

    fn copy(&self) -> Box<dyn Matcher> {
        Box::new(Self::new(self.message.clone(), self.expected.clone()).float_tol(self.float_tol))
    }

    fn name(&self) -> String {
        self.message.clone()
    }

    fn is_device(&self) -> bool {
        true
    }
}

impl From<EventExpectation> for Expectation {
    fn from(matcher: EventExpectation) -> Self {
        Expectation::from_matcher(matcher)
    }
}

/// Succeeds if the last known state matches, cancelled otherwise
///
/// The state is looked up by correlation key, by default the message name.
#[derive(Debug, Clone)]
pub struct StateExpectation {
    message: String,
    expected: Args,
    key: EventKey,
    float_tol: f64,
    matched: Option<Event>,
}

impl StateExpectation {
    pub fn new(message: impl Into<String>, expected: Args) -> Self {
        let message = message.into();
        Self {
            key: EventKey::named(message.clone()),
            message,
            expected,
            float_tol: defaults::FLOAT_TOLERANCE,
            matched: None,
        }
    }

    /// Look the state up under `key` instead of the message name
    pub fn with_key(mut self, key: EventKey) -> Self {
        self.key = key;
        self
    }

    pub fn float_tol(mut self, float_tol: f64) -> Self {
        self.float_tol = float_tol;
        self
    }

    fn evaluate(&mut self, scheduler: &Scheduler) -> Verdict {
        match scheduler.contexts().last_event(&self.key) {
            Some(state)
                if state.name() == self.message
                    && match_args(state.args(), &self.expected, self.float_tol) =>
            {
                self.matched = Some(state.with_policy(ExpectPolicy::Check));
                Verdict::Matched
            }
            Some(state) => {
                debug!(key = %self.key, state = %state, "State does not match");
                Verdict::Cancelled
            }
            None => {
                debug!(key = %self.key, "No known state");
                Verdict::Cancelled
            }
        }
    }
}

impl Matcher for StateExpectation {
    fn check(&mut self, _event: &Event) -> Verdict {
        Verdict::Pending
    }

    fn schedule(&mut self, scheduler: &Scheduler) -> Verdict {
        self.evaluate(scheduler)
    }

    fn arm(&mut self, scheduler: &Scheduler) -> Verdict {
        self.evaluate(scheduler)
    }

    fn expected(&self) -> EventContext {
        EventContext::from_events([Event::message(self.message.clone(), self.expected.clone())
            .with_key(self.key.clone())
            .with_policy(ExpectPolicy::Check)])
    }

    fn matched(&self) -> EventContext {
        self.matched.iter().cloned().collect()
    }

    fn unmatched(&self) -> EventContext {
        match self.matched {
            Some(_) => EventContext::new(),
            None => self.expected(),
        }
    }

    fn copy(&self) -> Box<dyn Matcher> {
        Box::new(
            Self::new(self.message.clone(), self.expected.clone())
                .with_key(self.key.clone())
                .float_tol(self.float_tol),
        )
    }

    fn name(&self) -> String {
        format!("{} (state)", self.message)
    }

    fn is_device(&self) -> bool {
        true
    }
}

impl From<StateExpectation> for Expectation {
    fn from(matcher: StateExpectation) -> Self {
        Expectation::from_matcher(matcher)
    }
}

/// Expect `message` with `args` under the given delivery policy
///
/// - `Wait`: the next matching event
/// - `Check`: the last known state, right now
/// - `CheckWait`: the last known state if it matches, else the next event
pub fn expect(message: &str, args: Args, policy: ExpectPolicy) -> Expectation {
    match policy {
        ExpectPolicy::Wait => EventExpectation::new(message, args).into(),
        ExpectPolicy::Check => StateExpectation::new(message, args).into(),
        ExpectPolicy::CheckWait => Expectation::check_then_wait(
            StateExpectation::new(message, args.clone()).into(),
            EventExpectation::new(message, args).into(),
        ),
    }
}
