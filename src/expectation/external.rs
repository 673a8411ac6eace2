//! Expectations wrapping an externally produced result
//!
//! The wrapped [`Completion`] is produced elsewhere (a command acknowledgement,
//! a background job, ...). The expectation succeeds when the completion
//! resolves to a value accepted by the status predicate.

use super::node::{Expectation, Kind};
use super::Verdict;
use crate::runtime::{Completion, CompletionError};
use crate::scheduler::Scheduler;
use std::sync::Arc;

/// Type-erased external result
pub(crate) trait ExternalSource: Send + 'static {
    fn verdict(&self) -> Verdict;

    /// Ask the scheduler to re-poll once the result is available
    fn wake(&self, scheduler: &Scheduler);

    fn cancel(&self);

    fn copy(&self) -> Box<dyn ExternalSource>;

    fn describe(&self) -> String;
}

struct CompletionSource<T> {
    completion: Completion<T>,
    accept: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T: Clone + Send + 'static> ExternalSource for CompletionSource<T> {
    fn verdict(&self) -> Verdict {
        match self.completion.peek() {
            None => Verdict::Pending,
            Some(Ok(value)) if (self.accept)(&value) => Verdict::Matched,
            Some(Ok(_)) => Verdict::Failed("External result rejected by its status check".to_string()),
            Some(Err(CompletionError::Cancelled)) => Verdict::Cancelled,
            Some(Err(CompletionError::Timeout)) => Verdict::TimedOut,
        }
    }

    fn wake(&self, scheduler: &Scheduler) {
        scheduler.wake_on(&self.completion);
    }

    fn cancel(&self) {
        self.completion.cancel();
    }

    fn copy(&self) -> Box<dyn ExternalSource> {
        Box::new(CompletionSource {
            completion: self.completion.clone(),
            accept: self.accept.clone(),
        })
    }

    fn describe(&self) -> String {
        "External result".to_string()
    }
}

impl Expectation {
    /// Succeed once `completion` resolves to a value accepted by `accept`
    ///
    /// Cancelling the expectation cancels the completion.
    pub fn external<T, F>(completion: Completion<T>, accept: F) -> Self
    where
        T: Clone + Send + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::from_kind(Kind::External(Box::new(CompletionSource {
            completion,
            accept: Arc::new(accept),
        })))
    }
}
