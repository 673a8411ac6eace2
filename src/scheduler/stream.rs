//! Admission control: bound the number of expectations in flight
//!
//! [`StreamScheduler`] wraps a [`Scheduler`]. Scheduled expectations wait in
//! a FIFO and at most `max_parallel` of them are handed to the wrapped
//! scheduler at once; each one resolving admits the next. Queue state is
//! only mutated on the scheduler loop.

use super::dispatcher::Scheduler;
use super::ExpectationScheduler;
use crate::expectation::Expectation;
use crate::runtime::{lock, Completion};
use crate::subscriber::{SubscribeOptions, Subscriber};
use skyctl_shared::{defaults, Event};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Admission control configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Expectations handed to the wrapped scheduler at once
    pub max_parallel: usize,
    /// Default timeout of [`StreamScheduler::join`]
    pub join_timeout: Option<Duration>,
    /// Waiting expectations kept; the oldest is cancelled on overflow
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            join_timeout: None,
            queue_capacity: defaults::STREAM_QUEUE_CAPACITY,
        }
    }
}

#[derive(Default)]
struct Queues {
    waiting: VecDeque<Expectation>,
    in_flight: Vec<Expectation>,
}

impl Queues {
    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.in_flight.is_empty()
    }
}

struct StreamState {
    config: StreamConfig,
    queues: Mutex<Queues>,
    idle: Condvar,
}

/// Scheduler decorator bounding concurrency
#[derive(Clone)]
pub struct StreamScheduler {
    scheduler: Scheduler,
    state: Arc<StreamState>,
}

impl StreamScheduler {
    pub fn new(scheduler: Scheduler, config: StreamConfig) -> Self {
        Self {
            scheduler,
            state: Arc::new(StreamState {
                config,
                queues: Mutex::new(Queues::default()),
                idle: Condvar::new(),
            }),
        }
    }

    /// The wrapped scheduler
    pub fn inner(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &StreamConfig {
        &self.state.config
    }

    /// Queue `expectation` and admit it if a slot is free
    pub fn schedule(&self, expectation: Expectation) -> Expectation {
        let this = self.clone();
        let queued = expectation.clone();
        let result = self.scheduler.event_loop().run_now_or_marshal(move || {
            this.enqueue(queued);
            this.pump();
        });
        if let Err(e) = result {
            warn!(scheduler = %self.scheduler.name(), error = %e, "Failed to queue expectation");
            expectation.cancel();
        }
        expectation
    }

    fn enqueue(&self, expectation: Expectation) {
        let evicted = {
            let mut queues = lock(&self.state.queues);
            let evicted = if queues.waiting.len() >= self.state.config.queue_capacity.max(1) {
                queues.waiting.pop_front()
            } else {
                None
            };
            queues.waiting.push_back(expectation);
            evicted
        };
        if let Some(evicted) = evicted {
            warn!(
                scheduler = %self.scheduler.name(),
                expectation = evicted.id(),
                "Admission queue full, cancelling oldest expectation"
            );
            evicted.cancel();
        }
    }

    /// Admit waiting expectations while slots are free; loop thread only
    fn pump(&self) {
        loop {
            let next = {
                let mut queues = lock(&self.state.queues);
                if queues.in_flight.len() >= self.state.config.max_parallel.max(1) {
                    None
                } else {
                    let next = queues.waiting.pop_front();
                    if let Some(expectation) = &next {
                        queues.in_flight.push(expectation.clone());
                    }
                    next
                }
            };
            let Some(expectation) = next else {
                break;
            };

            debug!(scheduler = %self.scheduler.name(), expectation = expectation.id(), "Expectation admitted");
            let this = self.clone();
            expectation.add_done_callback(move |done| this.release(done.id()));
            self.scheduler.schedule_local(&expectation);
        }
        self.notify_if_idle();
    }

    /// Free the slot of a resolved expectation
    ///
    /// Done callbacks may run on any thread and in the middle of a dispatch,
    /// so the bookkeeping is posted to the loop.
    fn release(&self, id: u64) {
        let this = self.clone();
        self.scheduler.event_loop().run_later(move || {
            lock(&this.state.queues).in_flight.retain(|e| e.id() != id);
            this.pump();
        });
    }

    fn notify_if_idle(&self) {
        if lock(&self.state.queues).is_idle() {
            self.state.idle.notify_all();
        }
    }

    /// Block until nothing is queued or in flight
    ///
    /// Uses the configured join timeout when `timeout` is None. Returns false
    /// if the timeout elapsed first.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.or(self.state.config.join_timeout);
        let queues = lock(&self.state.queues);
        match timeout {
            Some(timeout) => {
                let (queues, _) = self
                    .state
                    .idle
                    .wait_timeout_while(queues, timeout, |q| !q.is_idle())
                    .unwrap_or_else(|e| e.into_inner());
                queues.is_idle()
            }
            None => {
                let queues = self
                    .state
                    .idle
                    .wait_while(queues, |q| !q.is_idle())
                    .unwrap_or_else(|e| e.into_inner());
                queues.is_idle()
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state.queues).in_flight.len()
    }

    pub fn queued(&self) -> usize {
        lock(&self.state.queues).waiting.len()
    }
}

impl ExpectationScheduler for StreamScheduler {
    fn schedule(&self, expectation: Expectation) -> Expectation {
        StreamScheduler::schedule(self, expectation)
    }

    fn process_event(&self, event: Event) -> Completion<()> {
        self.scheduler.process_event(event)
    }

    fn subscribe<F>(&self, callback: F, options: SubscribeOptions) -> Subscriber
    where
        F: Fn(&Event, &Scheduler) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.scheduler.subscribe(callback, options)
    }

    fn unsubscribe(&self, subscriber: &Subscriber) -> bool {
        self.scheduler.unsubscribe(subscriber)
    }
}
