//! Resolve-once asynchronous result handle
//!
//! A [`Completion`] is shared between a producer (which resolves or cancels
//! it exactly once) and any number of consumers, which may block on it from a
//! plain thread, await it from async code, or register done callbacks.

use super::lock;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

/// Why a completion did not produce a value
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionError {
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Timed out waiting for the result")]
    Timeout,
}

type DoneCallback<T> = Box<dyn FnOnce(&Completion<T>) + Send>;

enum Slot<T> {
    Pending,
    Resolved(T),
    Cancelled,
}

struct State<T> {
    slot: Slot<T>,
    callbacks: Vec<DoneCallback<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    notify: Notify,
}

/// A cancellable, resolvable-once result handle
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Create a pending completion
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slot: Slot::Pending,
                    callbacks: Vec::new(),
                }),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Create an already resolved completion
    pub fn resolved(value: T) -> Self {
        let completion = Self::new();
        completion.resolve(value);
        completion
    }

    /// Resolve with `value`; returns false if already done
    pub fn resolve(&self, value: T) -> bool {
        self.finish(Slot::Resolved(value))
    }

    /// Cancel the completion; returns false if already done
    pub fn cancel(&self) -> bool {
        self.finish(Slot::Cancelled)
    }

    fn finish(&self, slot: Slot<T>) -> bool {
        let callbacks = {
            let mut state = lock(&self.shared.state);
            if !matches!(state.slot, Slot::Pending) {
                return false;
            }
            state.slot = slot;
            std::mem::take(&mut state.callbacks)
        };
        self.shared.cond.notify_all();
        self.shared.notify.notify_waiters();
        for callback in callbacks {
            callback(self);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        !matches!(lock(&self.shared.state).slot, Slot::Pending)
    }

    pub fn cancelled(&self) -> bool {
        matches!(lock(&self.shared.state).slot, Slot::Cancelled)
    }

    /// Current result without blocking, `None` while pending
    pub fn peek(&self) -> Option<Result<T, CompletionError>> {
        match &lock(&self.shared.state).slot {
            Slot::Pending => None,
            Slot::Resolved(value) => Some(Ok(value.clone())),
            Slot::Cancelled => Some(Err(CompletionError::Cancelled)),
        }
    }

    /// Block the calling thread until done, or until `timeout` elapses
    pub fn result(&self, timeout: Option<Duration>) -> Result<T, CompletionError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.shared.state);
        loop {
            match &state.slot {
                Slot::Resolved(value) => return Ok(value.clone()),
                Slot::Cancelled => return Err(CompletionError::Cancelled),
                Slot::Pending => {}
            }
            state = match deadline {
                None => self
                    .shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CompletionError::Timeout);
                    }
                    self.shared
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Wait for the result from async code
    pub async fn wait(&self) -> Result<T, CompletionError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.peek() {
                return result;
            }
            notified.await;
        }
    }

    /// Run `callback` once done; runs immediately if already done
    ///
    /// Callbacks run on the thread that resolves the completion and must not
    /// block.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Completion<T>) + Send + 'static) {
        {
            let mut state = lock(&self.shared.state);
            if matches!(state.slot, Slot::Pending) {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Whether both handles refer to the same completion
    pub fn ptr_eq(&self, other: &Completion<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match lock(&self.shared.state).slot {
            Slot::Pending => "pending",
            Slot::Resolved(_) => "resolved",
            Slot::Cancelled => "cancelled",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_resolve_once() {
        let c = Completion::new();
        assert!(c.resolve(1));
        assert!(!c.resolve(2));
        assert!(!c.cancel());
        assert_eq!(c.result(None), Ok(1));
        assert!(!c.cancelled());
    }

    #[test]
    fn test_cancel() {
        let c: Completion<u32> = Completion::new();
        assert!(c.cancel());
        assert!(c.cancelled());
        assert_eq!(c.result(None), Err(CompletionError::Cancelled));
    }

    #[test]
    fn test_result_timeout() {
        let c: Completion<u32> = Completion::new();
        assert_eq!(
            c.result(Some(Duration::from_millis(20))),
            Err(CompletionError::Timeout)
        );
        assert!(!c.is_done());
    }

    #[test]
    fn test_blocking_result_from_other_thread() {
        let c = Completion::new();
        let producer = c.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.resolve("done");
        });
        assert_eq!(c.result(Some(Duration::from_secs(2))), Ok("done"));
        handle.join().unwrap();
    }

    #[test]
    fn test_done_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Completion::new();

        let counter = calls.clone();
        c.add_done_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        c.resolve(());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Late registration runs immediately
        let counter = calls.clone();
        c.add_done_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_wait() {
        let c = Completion::new();
        let producer = c.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.resolve(42u8);
        });
        assert_eq!(c.wait().await, Ok(42));
    }
}
