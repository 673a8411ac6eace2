//! Expectation scheduler and event dispatcher

use super::context::{Context, ContextRegistry};
use super::timeout::TimeoutSweeper;
use crate::error::Result;
use crate::expectation::Expectation;
use crate::runtime::{lock, Completion, EventLoop, TimerHandle};
use crate::subscriber::{SubscribeOptions, Subscriber};
use skyctl_shared::{defaults, Event};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Used to name the loop threads and in logs
    pub name: String,
    /// Period of the background timeout sweep
    pub sweep_period: Duration,
    /// Queue size of subscribers that do not set one
    pub subscriber_queue_size: usize,
    /// Unsubscribe timeout of subscribers that do not set one
    pub subscriber_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "scheduler".to_string(),
            sweep_period: Duration::from_millis(defaults::SWEEP_PERIOD_MS),
            subscriber_queue_size: defaults::SUBSCRIBER_QUEUE_SIZE,
            subscriber_timeout: Duration::from_millis(defaults::SUBSCRIBER_TIMEOUT_MS),
        }
    }
}

pub(super) struct SchedulerInner {
    config: SchedulerConfig,
    /// Serializes every mutation of `pending` and `subscribers`
    event_loop: EventLoop,
    /// Runs subscriber callbacks
    worker: EventLoop,
    contexts: ContextRegistry,
    pending: Mutex<Vec<Expectation>>,
    subscribers: Mutex<Vec<Subscriber>>,
    sweeper: Mutex<Option<TimerHandle>>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.cancel();
        }
        self.worker.stop();
        self.event_loop.stop();
    }
}

/// Owns the pending expectations and subscribers of one session
///
/// Cheap to clone; clones share the same loop and state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Non-owning scheduler reference held by scheduled expectations
#[derive(Clone)]
pub struct WeakScheduler {
    inner: Weak<SchedulerInner>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }
}

impl Scheduler {
    /// Start the scheduler loop, the subscriber worker and the timeout sweep
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let event_loop = EventLoop::start(format!("{}-loop", config.name))?;
        let worker = EventLoop::start(format!("{}-subscribers", config.name))?;
        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                config,
                event_loop,
                worker,
                contexts: ContextRegistry::new(),
                pending: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                sweeper: Mutex::new(None),
            }),
        };

        let sweeper = TimeoutSweeper::new(&scheduler).start(&scheduler.inner.event_loop);
        *lock(&scheduler.inner.sweeper) = Some(sweeper);

        info!(scheduler = %scheduler.name(), "Scheduler started");
        Ok(scheduler)
    }

    /// Scheduler with the default configuration and the given name
    pub fn with_name(name: impl Into<String>) -> Result<Self> {
        Self::new(SchedulerConfig {
            name: name.into(),
            ..Default::default()
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Whether the calling thread is the scheduler loop
    pub fn is_loop_thread(&self) -> bool {
        self.inner.event_loop.is_current()
    }

    // ---- contexts ----

    pub fn contexts(&self) -> &ContextRegistry {
        &self.inner.contexts
    }

    pub fn add_context(&self, name: impl Into<String>, context: Arc<dyn Context>) {
        self.inner.contexts.insert(name, context);
    }

    pub fn remove_context(&self, name: &str) -> bool {
        self.inner.contexts.remove(name).is_some()
    }

    pub fn context(&self, name: &str) -> Option<Arc<dyn Context>> {
        self.inner.contexts.get(name)
    }

    // ---- expectations ----

    /// Schedule `expectation` and return it
    ///
    /// Runs on the scheduler loop, synchronously if called from it. Schedule
    /// hooks run first; a veto resolves the expectation the way the veto is
    /// resolved and no side effect runs.
    pub fn schedule(&self, expectation: Expectation) -> Expectation {
        let this = self.clone();
        let scheduled = expectation.clone();
        let result = self
            .inner
            .event_loop
            .run_now_or_marshal(move || this.schedule_local(&scheduled));
        if let Err(e) = result {
            warn!(scheduler = %self.name(), error = %e, "Failed to schedule expectation");
            expectation.cancel();
        }
        expectation
    }

    /// Schedule from the loop thread
    pub(crate) fn schedule_local(&self, expectation: &Expectation) {
        if let Some(veto) = self.inner.contexts.run_hooks(expectation) {
            info!(
                scheduler = %self.name(),
                expectation = expectation.id(),
                reason = %veto.explain(),
                "Expectation vetoed"
            );
            expectation.adopt(&veto);
            return;
        }

        expectation.schedule_on(self);
        if expectation.is_done() {
            if let Some(reason) = expectation.failure_reason() {
                warn!(
                    scheduler = %self.name(),
                    expectation = expectation.id(),
                    "Expectation failed when scheduled: {}",
                    reason
                );
            }
            return;
        }

        let mut pending = lock(&self.inner.pending);
        if !pending.iter().any(|p| p.ptr_eq(expectation)) {
            debug!(scheduler = %self.name(), expectation = expectation.id(), "Expectation scheduled");
            pending.push(expectation.clone());
        }
    }

    /// Dispatch `event` to pending expectations, then to subscribers
    ///
    /// Never blocks; events are processed in call order. The returned
    /// completion resolves once the event has been dispatched.
    pub fn process_event(&self, event: Event) -> Completion<()> {
        let this = self.clone();
        self.inner.event_loop.run_later(move || this.dispatch(&event))
    }

    fn dispatch(&self, event: &Event) {
        self.inner.contexts.observe(event);

        // Expectations scheduled by callbacks during the checks land in the
        // emptied list and are merged back afterwards
        let pending = std::mem::take(&mut *lock(&self.inner.pending));
        let mut remaining = Vec::with_capacity(pending.len());
        for expectation in pending {
            expectation.check(event);
            if expectation.is_done() {
                debug!(
                    scheduler = %self.name(),
                    expectation = expectation.id(),
                    event = %event,
                    "Expectation resolved"
                );
            } else {
                remaining.push(expectation);
            }
        }
        {
            let mut pending = lock(&self.inner.pending);
            remaining.append(&mut pending);
            *pending = remaining;
        }

        self.notify_subscribers(event);
    }

    /// Remove resolved expectations, polling deadlines and external results
    pub(super) fn collect(&self) {
        let pending = std::mem::take(&mut *lock(&self.inner.pending));
        let mut remaining = Vec::with_capacity(pending.len());
        for expectation in pending {
            expectation.poll();
            if !expectation.is_done() {
                remaining.push(expectation);
            } else if expectation.timed_out() {
                debug!(scheduler = %self.name(), expectation = expectation.id(), "Expectation timed out");
            }
        }
        let mut pending = lock(&self.inner.pending);
        remaining.append(&mut pending);
        *pending = remaining;
    }

    /// Sweep as soon as `completion` is done
    ///
    /// Used by expectations waiting on an asynchronous result produced
    /// outside the event stream.
    pub fn wake_on<T: Clone + Send + 'static>(&self, completion: &Completion<T>) {
        let scheduler = self.downgrade();
        completion.add_done_callback(move |_| {
            if let Some(scheduler) = scheduler.upgrade() {
                let this = scheduler.clone();
                scheduler.inner.event_loop.run_later(move || this.collect());
            }
        });
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    // ---- subscribers ----

    /// Register a subscriber; `callback` runs on the subscriber worker
    pub fn subscribe<F>(&self, callback: F, options: SubscribeOptions) -> Subscriber
    where
        F: Fn(&Event, &Scheduler) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let options = options.or_defaults(
            self.inner.config.subscriber_queue_size,
            self.inner.config.subscriber_timeout,
        );
        let subscriber = Subscriber::new(callback, options);
        self.register(subscriber.clone());
        subscriber
    }

    fn register(&self, subscriber: Subscriber) {
        let this = self.clone();
        let result = self
            .inner
            .event_loop
            .run_now_or_marshal(move || lock(&this.inner.subscribers).push(subscriber));
        if let Err(e) = result {
            warn!(scheduler = %self.name(), error = %e, "Failed to register subscriber");
        }
    }

    /// Remove `subscriber` and wait for its running callbacks
    ///
    /// The wait is bounded by the subscriber timeout and skipped when called
    /// from a subscriber callback. Returns whether it was registered.
    pub fn unsubscribe(&self, subscriber: &Subscriber) -> bool {
        let this = self.clone();
        let id = subscriber.id();
        let removed = self
            .inner
            .event_loop
            .run_now_or_marshal(move || {
                let mut subscribers = lock(&this.inner.subscribers);
                let before = subscribers.len();
                subscribers.retain(|s| s.id() != id);
                before != subscribers.len()
            })
            .unwrap_or(false);

        subscriber.cancel_filter();
        if !self.inner.worker.is_current() {
            subscriber.wait_idle();
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    fn notify_subscribers(&self, event: &Event) {
        let subscribers = lock(&self.inner.subscribers).clone();

        let mut defaults: Vec<Subscriber> = Vec::new();
        for subscriber in &subscribers {
            if let Some(default) = subscriber.default() {
                if !defaults.iter().any(|d| d.id() == default.id()) {
                    defaults.push(default.clone());
                }
            }
        }

        for subscriber in &subscribers {
            if subscriber.notify(event, self) {
                if let Some(default) = subscriber.default() {
                    defaults.retain(|d| d.id() != default.id());
                }
                self.run_subscriber(subscriber);
            }
        }

        for default in &defaults {
            if default.notify(event, self) {
                self.run_subscriber(default);
            }
        }
    }

    fn run_subscriber(&self, subscriber: &Subscriber) {
        let this = self.clone();
        let job = subscriber.clone();
        let done = self.inner.worker.run_later(move || job.process(&this));
        subscriber.track(done);
    }

    // ---- lifecycle ----

    /// Cancel every pending expectation
    pub fn stop(&self) {
        let this = self.clone();
        let result = self.inner.event_loop.run_now_or_marshal(move || {
            let pending = std::mem::take(&mut *lock(&this.inner.pending));
            for expectation in &pending {
                expectation.cancel();
            }
            pending.len()
        });
        match result {
            Ok(cancelled) => info!(scheduler = %self.name(), cancelled, "Scheduler stopped"),
            Err(e) => warn!(scheduler = %self.name(), error = %e, "Failed to stop scheduler"),
        }
    }

    /// Stop, drop every subscriber and shut the loops down
    ///
    /// The scheduler cannot be used afterwards: scheduling cancels the
    /// expectation and events are dropped.
    pub fn destroy(&self) {
        self.stop();
        if let Some(sweeper) = lock(&self.inner.sweeper).take() {
            sweeper.cancel();
        }
        let subscribers = std::mem::take(&mut *lock(&self.inner.subscribers));
        for subscriber in &subscribers {
            subscriber.cancel_filter();
        }
        self.inner.worker.stop();
        self.inner.event_loop.stop();
        info!(scheduler = %self.name(), "Scheduler destroyed");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name())
            .field("pending", &self.pending_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{expect, Command};
    use crate::testing::{event, scheduler, FakeDrone, Probe};
    use skyctl_shared::{args, ExpectPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Option<Duration> = Some(Duration::from_secs(2));

    #[test]
    fn test_schedule_then_event_resolves() {
        let scheduler = scheduler("dispatch");
        let expectation = scheduler.schedule(Expectation::from_matcher(Probe::new("Landed")));
        assert!(expectation.is_scheduled());
        assert_eq!(scheduler.pending_count(), 1);

        scheduler.process_event(event("Landed", args! {}));
        assert!(expectation.wait(WAIT).is_success());

        scheduler.process_event(event("Other", args! {})).result(WAIT).unwrap();
        assert_eq!(scheduler.pending_count(), 0);
        scheduler.destroy();
    }

    #[test]
    fn test_timeout_without_traffic() {
        let scheduler = scheduler("sweep");
        let expectation = scheduler.schedule(
            Expectation::from_matcher(Probe::new("Never")).with_timeout(Duration::from_millis(50)),
        );
        std::thread::sleep(Duration::from_millis(300));
        assert!(expectation.timed_out());
        assert!(expectation.cancelled());
        assert_eq!(scheduler.pending_count(), 0);
        scheduler.destroy();
    }

    #[test]
    fn test_any_of_pre_resolved_cancels_sibling() {
        let scheduler = scheduler("any-race");
        let pending = Expectation::from_matcher(Probe::new("Never"));
        let any = scheduler.schedule(Expectation::succeeded() | pending.clone());
        assert!(any.success());
        assert!(pending.cancelled());
        assert_eq!(scheduler.pending_count(), 0);
        scheduler.destroy();
    }

    #[test]
    fn test_sequence_defers_side_effects() {
        let scheduler = scheduler("sequence");
        let first = Probe::new("A");
        let second = Probe::new("B");
        let second_schedules = second.schedules();
        let seq = scheduler.schedule(
            Expectation::from_matcher(first) >> Expectation::from_matcher(second),
        );
        assert_eq!(second_schedules.load(Ordering::SeqCst), 0);

        scheduler.process_event(event("B", args! {}));
        scheduler.process_event(event("A", args! {})).result(WAIT).unwrap();
        assert_eq!(second_schedules.load(Ordering::SeqCst), 1);
        assert!(!seq.is_done());

        scheduler.process_event(event("B", args! {}));
        assert!(seq.wait(WAIT).is_success());
        scheduler.destroy();
    }

    #[test]
    fn test_sequence_child_timeout_fails_sequence() {
        let scheduler = scheduler("sequence-timeout");
        let seq = scheduler.schedule(
            Expectation::from_matcher(Probe::new("A"))
                >> Expectation::from_matcher(Probe::new("B")).with_timeout(Duration::from_millis(30)),
        );
        scheduler.process_event(event("A", args! {}));
        assert!(seq.wait(WAIT).is_timed_out());
        scheduler.destroy();
    }

    #[test]
    fn test_check_then_wait_short_circuits() {
        let scheduler = scheduler("ctw");
        let wait = Probe::new("State");
        let wait_schedules = wait.schedules();
        let ctw = scheduler.schedule(Expectation::check_then_wait(
            Expectation::succeeded(),
            Expectation::from_matcher(wait),
        ));
        assert!(ctw.success());
        assert_eq!(wait_schedules.load(Ordering::SeqCst), 0);
        scheduler.destroy();
    }

    #[test]
    fn test_veto_resolves_without_side_effect() {
        let scheduler = scheduler("veto");
        let drone = FakeDrone::new();
        scheduler.add_context("drone", drone.clone());
        let guard = Arc::new(crate::connection::ConnectionGuard::new());
        scheduler.add_context("connection", guard.clone());

        let takeoff = scheduler.schedule(Command::new("TakeOff", args! {}).into());
        assert_eq!(takeoff.failure_reason().as_deref(), Some("Not connected to any device"));
        assert!(drone.sent().is_empty());

        let connect = scheduler.schedule(Command::lifecycle("Connect", args! {}).into());
        assert!(connect.success());
        assert_eq!(drone.sent().len(), 1);
        scheduler.destroy();
    }

    #[test]
    fn test_takeoff_scenario() {
        let scheduler = scheduler("takeoff");
        let takeoff = scheduler.schedule(
            (expect("Ack", args! { "command" => "takeoff" }, ExpectPolicy::Wait)
                & expect("FlyingStateChanged", args! { "state" => "hovering" }, ExpectPolicy::Wait))
            .with_timeout(Duration::from_secs(5)),
        );

        let ack = event("Ack", args! { "command" => "takeoff" });
        let state = event("FlyingStateChanged", args! { "state" => "hovering" });
        scheduler.process_event(ack.clone());
        std::thread::sleep(Duration::from_millis(100));
        assert!(!takeoff.is_done());
        scheduler.process_event(state.clone());

        match takeoff.wait(Some(Duration::from_secs(5))) {
            crate::expectation::Outcome::Success(events) => {
                let uuids: Vec<_> = events.iter().map(|e| e.uuid()).collect();
                assert_eq!(uuids, [ack.uuid(), state.uuid()]);
            }
            other => panic!("takeoff did not succeed: {}", other),
        }
        assert_eq!(takeoff.matched_events().len(), 2);
        scheduler.destroy();
    }

    #[test]
    fn test_subscriber_receives_matching_events() {
        let scheduler = scheduler("subscribe");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let subscriber = scheduler.subscribe(
            move |_event, _scheduler| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            SubscribeOptions::new().filter(Expectation::from_matcher(Probe::new("Battery"))),
        );

        scheduler.process_event(event("Battery", args! { "percent" => 80 }));
        scheduler.process_event(event("Gps", args! {}));
        scheduler.process_event(event("Battery", args! { "percent" => 79 })).result(WAIT).unwrap();

        assert!(scheduler.unsubscribe(&subscriber));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(!scheduler.unsubscribe(&subscriber));
        scheduler.destroy();
    }

    #[test]
    fn test_default_subscriber_fallback() {
        let scheduler = scheduler("defaults");
        let specific = Arc::new(Mutex::new(Vec::new()));
        let fallback = Arc::new(Mutex::new(Vec::new()));

        let sink = fallback.clone();
        let default = Subscriber::new(
            move |event: &Event, _: &Scheduler| {
                sink.lock().unwrap().push(event.name().to_string());
                Ok(())
            },
            SubscribeOptions::new(),
        );
        let sink = specific.clone();
        let subscriber = scheduler.subscribe(
            move |event, _| {
                sink.lock().unwrap().push(event.name().to_string());
                Ok(())
            },
            SubscribeOptions::new()
                .filter(Expectation::from_matcher(Probe::new("Battery")))
                .with_default(default.clone()),
        );

        scheduler.process_event(event("Battery", args! {}));
        scheduler.process_event(event("Gps", args! {})).result(WAIT).unwrap();
        scheduler.unsubscribe(&subscriber);
        default.wait_idle();

        assert_eq!(*specific.lock().unwrap(), ["Battery"]);
        assert_eq!(*fallback.lock().unwrap(), ["Gps"]);
        scheduler.destroy();
    }

    #[test]
    fn test_shared_default_runs_once_per_event() {
        let scheduler = scheduler("shared-default");
        let battery = Arc::new(Mutex::new(Vec::new()));
        let gps = Arc::new(Mutex::new(Vec::new()));
        let fallback = Arc::new(Mutex::new(Vec::new()));

        let sink = fallback.clone();
        let default = Subscriber::new(
            move |event: &Event, _: &Scheduler| {
                sink.lock().unwrap().push(event.name().to_string());
                Ok(())
            },
            SubscribeOptions::new(),
        );
        let mut subscribers = Vec::new();
        for (name, seen) in [("Battery", battery.clone()), ("Gps", gps.clone())] {
            subscribers.push(scheduler.subscribe(
                move |event, _| {
                    seen.lock().unwrap().push(event.name().to_string());
                    Ok(())
                },
                SubscribeOptions::new()
                    .filter(Expectation::from_matcher(Probe::new(name)))
                    .with_default(default.clone()),
            ));
        }

        scheduler.process_event(event("Battery", args! {}));
        scheduler.process_event(event("Gps", args! {}));
        scheduler.process_event(event("Alert", args! {})).result(WAIT).unwrap();
        for subscriber in &subscribers {
            scheduler.unsubscribe(subscriber);
        }
        default.wait_idle();

        assert_eq!(*battery.lock().unwrap(), ["Battery"]);
        assert_eq!(*gps.lock().unwrap(), ["Gps"]);
        assert_eq!(*fallback.lock().unwrap(), ["Alert"]);
        scheduler.destroy();
    }

    #[test]
    fn test_wait_on_loop_leaves_expectation_pending() {
        let scheduler = scheduler("wait-on-loop");
        let landed = scheduler.schedule(Expectation::from_matcher(Probe::new("Landed")));

        let handle = landed.clone();
        let outcome = scheduler
            .event_loop()
            .run_now_or_marshal(move || handle.wait(Some(Duration::from_secs(5))))
            .unwrap();
        assert!(outcome.is_timed_out());
        assert!(!landed.is_done());
        assert!(!landed.timed_out());

        scheduler.process_event(event("Landed", args! {})).result(WAIT).unwrap();
        assert!(landed.wait(WAIT).is_success());
        scheduler.destroy();
    }

    #[test]
    fn test_failing_callback_does_not_block_others() {
        let scheduler = scheduler("callback-errors");
        let seen = Arc::new(AtomicUsize::new(0));

        let failing = scheduler.subscribe(
            |_, _| Err(anyhow::anyhow!("callback failure")),
            SubscribeOptions::new(),
        );
        let panicking = scheduler.subscribe(|_, _| panic!("callback panic"), SubscribeOptions::new());
        let counter = seen.clone();
        let working = scheduler.subscribe(
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            SubscribeOptions::new(),
        );

        scheduler.process_event(event("Gps", args! {}));
        scheduler.process_event(event("Gps", args! {})).result(WAIT).unwrap();
        for subscriber in [&failing, &panicking, &working] {
            scheduler.unsubscribe(subscriber);
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        scheduler.destroy();
    }

    #[test]
    fn test_stop_cancels_pending() {
        let scheduler = scheduler("stop");
        let expectation = scheduler.schedule(Expectation::from_matcher(Probe::new("Never")));
        scheduler.stop();
        assert!(expectation.cancelled());
        assert_eq!(scheduler.pending_count(), 0);

        scheduler.destroy();
        let late = scheduler.schedule(Expectation::from_matcher(Probe::new("Never")));
        assert!(late.cancelled());
    }

    #[tokio::test]
    async fn test_schedule_from_async_context() {
        let scheduler = scheduler("async");
        let expectation = scheduler.schedule(Expectation::from_matcher(Probe::new("Landed")));
        scheduler.process_event(event("Landed", args! {}));
        assert!(expectation.resolved().await.is_success());
        scheduler.destroy();
    }
}
