//! Leaf expectation trait

use super::Verdict;
use crate::scheduler::Scheduler;
use skyctl_shared::{Event, EventContext};

/// The user-facing part of a leaf expectation
///
/// A matcher is owned by exactly one [`Expectation`](super::Expectation),
/// which guards it and enforces the terminal-state contract: once a method
/// returned something other than [`Verdict::Pending`], the matcher is never
/// called again (except for `expected`/`matched`/... used in diagnostics).
///
/// None of these methods may block: they run on the scheduler loop.
pub trait Matcher: Send + 'static {
    /// Offer an incoming event
    fn check(&mut self, event: &Event) -> Verdict;

    /// Events this matcher is waiting for
    fn expected(&self) -> EventContext;

    /// Events that satisfied this matcher
    fn matched(&self) -> EventContext;

    /// Events still expected
    fn unmatched(&self) -> EventContext;

    /// Fresh, unattached matcher with the same configuration
    fn copy(&self) -> Box<dyn Matcher>;

    /// Short name used in logs
    fn name(&self) -> String;

    /// Events offered to this matcher that carried the expected message
    fn received(&self) -> EventContext {
        EventContext::new()
    }

    /// Commit the side effect, if any; called once, from the scheduler loop
    fn schedule(&mut self, scheduler: &Scheduler) -> Verdict {
        let _ = scheduler;
        Verdict::Pending
    }

    /// Bind to a scheduler without any side effect (subscriber filters)
    fn arm(&mut self, scheduler: &Scheduler) -> Verdict {
        let _ = scheduler;
        Verdict::Pending
    }

    /// Re-evaluate without an event, e.g. after an asynchronous reply
    fn poll(&mut self) -> Verdict {
        Verdict::Pending
    }

    /// Release whatever the side effect left running
    fn cancel(&mut self) {}

    /// Connection lifecycle expectations are exempt from connection vetoes
    fn is_lifecycle(&self) -> bool {
        false
    }

    /// Sends to or waits on the device, and so needs a live connection
    fn is_device(&self) -> bool {
        false
    }

    /// Custom explanation, defaults to the marked expected events
    fn explain(&self) -> Option<String> {
        None
    }
}
