//! Execution contexts and result handles
//!
//! This module provides the two primitives the expectation engine is built
//! on:
//! - [`EventLoop`]: a single-threaded context used to serialize all
//!   scheduler state mutation (and, separately, subscriber callbacks)
//! - [`Completion`]: a resolve-once result handle usable from blocking,
//!   async and callback style code

mod completion;
mod event_loop;

pub use completion::{Completion, CompletionError};
pub use event_loop::{EventLoop, TimerHandle};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking thread poisoned it
///
/// Panics in user callbacks are caught and logged, so a poisoned lock only
/// means a callback failed while some state was borrowed.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
