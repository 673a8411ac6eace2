//! Expectations and combinators
//!
//! An [`Expectation`] is a resumable predicate over the protocol event
//! stream, optionally carrying a side effect committed when it is scheduled.
//! It resolves exactly once to success, cancellation, timeout or failure.
//!
//! This module handles:
//! - The expectation state machine and its terminal-state contract
//! - The AnyOf / AllOf / Sequence / CheckThenWait combinators
//! - Expectations wrapping an externally produced result
//! - The [`Matcher`] trait used to define leaf expectations

mod combinators;
mod external;
mod matcher;
mod node;

pub use matcher::Matcher;
pub use node::{AsCompleted, Expectation};

use skyctl_shared::EventContext;

/// What a [`Matcher`] (or a combinator) concluded after an update
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Not resolved yet
    Pending,
    /// The expectation is satisfied
    Matched,
    /// Resolved as cancelled (e.g. a state check that does not hold)
    Cancelled,
    /// Resolved as timed out
    TimedOut,
    /// Resolved as failed with a reason
    Failed(String),
}

/// Terminal result of an expectation
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Resolved successfully, with the events that matched
    Success(EventContext),
    Cancelled,
    TimedOut,
    /// Vetoed, or the side effect failed
    Failed(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }

    /// Matched events for a successful outcome
    pub fn events(&self) -> Option<&EventContext> {
        match self {
            Outcome::Success(events) => Some(events),
            _ => None,
        }
    }

    /// Failure reason for a failed outcome
    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success(events) => write!(f, "success: {}", events),
            Outcome::Cancelled => write!(f, "cancelled"),
            Outcome::TimedOut => write!(f, "timed out"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
