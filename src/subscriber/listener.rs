//! Grouped subscriptions with a shared catch-all handler

use super::{Callback, SubscribeOptions, Subscriber};
use crate::expectation::Expectation;
use crate::scheduler::Scheduler;
use skyctl_shared::Event;
use std::sync::Arc;
use std::time::Duration;

struct Handler {
    filter: Expectation,
    callback: Callback,
}

/// A set of (filter, handler) subscriptions managed together
///
/// Events matched by none of the filters go to the default handler, if any.
/// Every handler is subscribed with a fresh copy of its filter, so the
/// listener can be subscribed again after an unsubscribe. Dropping the
/// listener unsubscribes it.
pub struct EventListener {
    scheduler: Scheduler,
    handlers: Vec<Handler>,
    default: Option<Callback>,
    queue_size: Option<usize>,
    timeout: Option<Duration>,
    subscribers: Vec<Subscriber>,
}

impl EventListener {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            handlers: Vec::new(),
            default: None,
            queue_size: None,
            timeout: None,
            subscribers: Vec::new(),
        }
    }

    /// Call `callback` for events matching `filter`
    pub fn on<F>(mut self, filter: Expectation, callback: F) -> Self
    where
        F: Fn(&Event, &Scheduler) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.push(Handler {
            filter,
            callback: Arc::new(callback),
        });
        self
    }

    /// Call `callback` for events no handler matched
    pub fn on_default<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event, &Scheduler) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.default = Some(Arc::new(callback));
        self
    }

    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn options(&self) -> SubscribeOptions {
        let config = self.scheduler.config();
        SubscribeOptions::new().or_defaults(
            self.queue_size.unwrap_or(config.subscriber_queue_size),
            self.timeout.unwrap_or(config.subscriber_timeout),
        )
    }

    pub fn is_subscribed(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Subscribe every handler; no-op if already subscribed
    pub fn subscribe(&mut self) {
        if self.is_subscribed() {
            return;
        }
        let default = self
            .default
            .as_ref()
            .map(|callback| Subscriber::with_callback(callback.clone(), self.options()));

        for handler in &self.handlers {
            let mut options = self.options().filter(handler.filter.copy());
            if let Some(default) = &default {
                options = options.with_default(default.clone());
            }
            let callback = handler.callback.clone();
            let subscriber = self
                .scheduler
                .subscribe(move |event, scheduler| callback(event, scheduler), options);
            self.subscribers.push(subscriber);
        }

        // Without specific handlers the default one receives everything
        if self.handlers.is_empty() {
            if let Some(callback) = &self.default {
                let callback = callback.clone();
                let subscriber = self
                    .scheduler
                    .subscribe(move |event, scheduler| callback(event, scheduler), self.options());
                self.subscribers.push(subscriber);
            }
        }
    }

    /// Unsubscribe every handler, waiting for running callbacks
    pub fn unsubscribe(&mut self) {
        for subscriber in std::mem::take(&mut self.subscribers) {
            self.scheduler.unsubscribe(&subscriber);
            if let Some(default) = subscriber.default() {
                default.wait_idle();
            }
        }
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
