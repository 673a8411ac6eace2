//! Expectation scheduling and event fan-out
//!
//! This module handles:
//! - Scheduling expectations on a single serialized loop
//! - Dispatching protocol events to pending expectations and subscribers
//! - Sweeping expectations past their deadline
//! - Schedule hooks and capabilities of named contexts
//! - Admission control over the number of expectations in flight

mod context;
mod dispatcher;
mod stream;
mod timeout;

pub use context::{CommandSender, Context, ContextRegistry, StateQuery};
pub use dispatcher::{Scheduler, SchedulerConfig, WeakScheduler};
pub use stream::{StreamConfig, StreamScheduler};

use crate::expectation::Expectation;
use crate::runtime::Completion;
use crate::subscriber::{SubscribeOptions, Subscriber};
use skyctl_shared::Event;

/// Operations shared by the scheduler and its decorators
pub trait ExpectationScheduler {
    fn schedule(&self, expectation: Expectation) -> Expectation;

    fn process_event(&self, event: Event) -> Completion<()>;

    fn subscribe<F>(&self, callback: F, options: SubscribeOptions) -> Subscriber
    where
        F: Fn(&Event, &Scheduler) -> anyhow::Result<()> + Send + Sync + 'static;

    fn unsubscribe(&self, subscriber: &Subscriber) -> bool;
}

impl ExpectationScheduler for Scheduler {
    fn schedule(&self, expectation: Expectation) -> Expectation {
        Scheduler::schedule(self, expectation)
    }

    fn process_event(&self, event: Event) -> Completion<()> {
        Scheduler::process_event(self, event)
    }

    fn subscribe<F>(&self, callback: F, options: SubscribeOptions) -> Subscriber
    where
        F: Fn(&Event, &Scheduler) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Scheduler::subscribe(self, callback, options)
    }

    fn unsubscribe(&self, subscriber: &Subscriber) -> bool {
        Scheduler::unsubscribe(self, subscriber)
    }
}
