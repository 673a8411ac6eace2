//! Event subscribers
//!
//! A [`Subscriber`] is a bounded mailbox with a callback. The scheduler loop
//! offers it every event, the optional filter decides whether to enqueue it,
//! and the callback drains the mailbox on the subscriber worker so a slow
//! callback never delays dispatch.

mod listener;

pub use listener::EventListener;

use crate::expectation::Expectation;
use crate::runtime::{lock, Completion};
use crate::scheduler::Scheduler;
use skyctl_shared::{defaults, Event};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Subscriber callback
pub type Callback = Arc<dyn Fn(&Event, &Scheduler) -> anyhow::Result<()> + Send + Sync>;

/// Called with the evicted event when a subscriber queue overflows
pub type OverrunHook = Arc<dyn Fn(&Subscriber, &Event) + Send + Sync>;

/// Options of [`Scheduler::subscribe`]
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub(crate) filter: Option<Expectation>,
    pub(crate) queue_size: Option<usize>,
    pub(crate) default: Option<Subscriber>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) on_overrun: Option<OverrunHook>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only deliver events matching `filter`; it is re-armed after each match
    pub fn filter(mut self, filter: Expectation) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Bound of the event queue; the oldest event is dropped on overflow
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    /// Fallback receiving the events no subscriber naming it matched
    pub fn with_default(mut self, default: Subscriber) -> Self {
        self.default = Some(default);
        self
    }

    /// Bound of the wait for running callbacks on unsubscribe
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_overrun(mut self, hook: impl Fn(&Subscriber, &Event) + Send + Sync + 'static) -> Self {
        self.on_overrun = Some(Arc::new(hook));
        self
    }

    pub(crate) fn or_defaults(mut self, queue_size: usize, timeout: Duration) -> Self {
        self.queue_size.get_or_insert(queue_size);
        self.timeout.get_or_insert(timeout);
        self
    }
}

struct SubscriberInner {
    id: u64,
    callback: Callback,
    filter: Mutex<Option<Expectation>>,
    queue: Mutex<VecDeque<Event>>,
    queue_size: usize,
    default: Option<Subscriber>,
    timeout: Duration,
    on_overrun: Option<OverrunHook>,
    overruns: AtomicU64,
    running: Mutex<Vec<Completion<()>>>,
}

/// Handle to a registered (or standalone default) subscriber
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    /// Create a subscriber without registering it
    ///
    /// Registered subscribers come from [`Scheduler::subscribe`]; standalone
    /// ones are used as `default` fallbacks.
    pub fn new<F>(callback: F, options: SubscribeOptions) -> Self
    where
        F: Fn(&Event, &Scheduler) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_callback(Arc::new(callback), options)
    }

    pub(crate) fn with_callback(callback: Callback, options: SubscribeOptions) -> Self {
        let queue_size = options
            .queue_size
            .unwrap_or(defaults::SUBSCRIBER_QUEUE_SIZE)
            .max(1);
        Self {
            inner: Arc::new(SubscriberInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                callback,
                filter: Mutex::new(options.filter),
                queue: Mutex::new(VecDeque::new()),
                queue_size,
                default: options.default,
                timeout: options
                    .timeout
                    .unwrap_or(Duration::from_millis(defaults::SUBSCRIBER_TIMEOUT_MS)),
                on_overrun: options.on_overrun,
                overruns: AtomicU64::new(0),
                running: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue_size
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn default(&self) -> Option<&Subscriber> {
        self.inner.default.as_ref()
    }

    /// Events waiting for the callback
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Events dropped because the queue was full
    pub fn overruns(&self) -> u64 {
        self.inner.overruns.load(Ordering::Relaxed)
    }

    /// Current filter instance
    pub fn filter(&self) -> Option<Expectation> {
        lock(&self.inner.filter).clone()
    }

    /// Offer an event; returns whether it was enqueued
    ///
    /// Runs on the scheduler loop. A filter that already matched (or was
    /// cancelled) is replaced by a fresh copy before checking.
    pub(crate) fn notify(&self, event: &Event, scheduler: &Scheduler) -> bool {
        let matched = {
            let mut filter = lock(&self.inner.filter);
            match filter.as_mut() {
                None => true,
                Some(current) => {
                    current.arm(scheduler);
                    if current.is_done() {
                        *current = current.copy();
                        current.arm(scheduler);
                    }
                    !current.is_done() && current.check(event).success()
                }
            }
        };
        if matched {
            self.enqueue(event.clone());
        }
        matched
    }

    fn enqueue(&self, event: Event) {
        let evicted = {
            let mut queue = lock(&self.inner.queue);
            let evicted = if queue.len() >= self.inner.queue_size {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(event);
            evicted
        };
        if let Some(evicted) = evicted {
            let overruns = self.inner.overruns.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                subscriber = self.id(),
                overruns,
                event = %evicted,
                "Subscriber queue overrun, dropping oldest event"
            );
            if let Some(hook) = &self.inner.on_overrun {
                if catch_unwind(AssertUnwindSafe(|| hook(self, &evicted))).is_err() {
                    error!(subscriber = self.id(), "Overrun hook panicked");
                }
            }
        }
    }

    /// Drain the queue through the callback; runs on the subscriber worker
    pub(crate) fn process(&self, scheduler: &Scheduler) {
        loop {
            let Some(event) = lock(&self.inner.queue).pop_front() else {
                break;
            };
            match catch_unwind(AssertUnwindSafe(|| (self.inner.callback)(&event, scheduler))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(subscriber = self.id(), event = %event, "Subscriber callback failed: {:#}", e),
                Err(_) => error!(subscriber = self.id(), event = %event, "Subscriber callback panicked"),
            }
        }
    }

    /// Remember a posted `process` run so that unsubscribe can wait for it
    pub(crate) fn track(&self, done: Completion<()>) {
        let mut running = lock(&self.inner.running);
        running.retain(|c| !c.is_done());
        running.push(done);
    }

    /// Wait for the posted runs, bounded by the subscriber timeout
    pub(crate) fn wait_idle(&self) {
        let running = std::mem::take(&mut *lock(&self.inner.running));
        for done in running {
            if let Err(e) = done.result(Some(self.inner.timeout)) {
                if e == crate::runtime::CompletionError::Timeout {
                    warn!(
                        subscriber = self.id(),
                        timeout_ms = self.inner.timeout.as_millis() as u64,
                        "Timed out waiting for subscriber callback"
                    );
                    return;
                }
            }
        }
    }

    pub(crate) fn cancel_filter(&self) {
        if let Some(filter) = lock(&self.inner.filter).as_ref() {
            filter.cancel();
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.inner.id)
            .field("queue_size", &self.inner.queue_size)
            .field("queued", &self.queued())
            .field("overruns", &self.overruns())
            .finish()
    }
}
