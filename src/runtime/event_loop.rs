//! Single-threaded execution context
//!
//! An [`EventLoop`] owns one OS thread driving a current-thread tokio
//! runtime. Every job posted to it runs on that thread, in posting order,
//! which makes it the serialization point for whatever state it guards.
//! Timers (`run_delayed`, `run_periodic`) are tokio tasks on the same runtime
//! so they interleave with posted jobs but never run concurrently with them.

use super::completion::Completion;
use super::lock;
use crate::error::{Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    Stop,
}

struct LoopInner {
    name: String,
    tx: mpsc::UnboundedSender<Message>,
    handle: Handle,
    thread_id: ThreadId,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Stop);
    }
}

/// Cancels the completion of a posted job dropped without running
///
/// Jobs still queued when the loop stops are dropped with the channel.
struct CancelOnDrop(Completion<()>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Handle to a delayed or periodic job
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Stop the timer; a job already running is not interrupted
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// A named, single-threaded execution context
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Spawn the loop thread and start processing jobs
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        let handle = runtime.handle().clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let running = Arc::new(AtomicBool::new(true));

        let loop_name = name.clone();
        let loop_running = running.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(event_loop = %loop_name, "Event loop started");
                runtime.block_on(async {
                    while let Some(message) = rx.recv().await {
                        match message {
                            Message::Run(job) => run_job(&loop_name, job),
                            Message::Stop => break,
                        }
                    }
                });
                loop_running.store(false, Ordering::SeqCst);
                debug!(event_loop = %loop_name, "Event loop stopped");
            })
            .map_err(Error::Spawn)?;
        let thread_id = thread.thread().id();

        Ok(Self {
            inner: Arc::new(LoopInner {
                name,
                tx,
                handle,
                thread_id,
                thread: Mutex::new(Some(thread)),
                running,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is this loop's thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn post(&self, job: Job) -> Result<()> {
        self.inner
            .tx
            .send(Message::Run(job))
            .map_err(|_| Error::LoopStopped(self.inner.name.clone()))
    }

    /// Run `f` on the loop and return its result
    ///
    /// When called from the loop thread `f` runs synchronously, otherwise the
    /// calling thread blocks until the loop has executed it.
    pub fn run_now_or_marshal<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }
        let (tx, rx) = oneshot::channel();
        self.post(Box::new(move || {
            let _ = tx.send(f());
        }))?;
        // The sender is dropped without a value if the job panicked
        futures::executor::block_on(rx).map_err(|_| Error::JobPanicked(self.inner.name.clone()))
    }

    /// Post `f` to run after the jobs already queued; never blocks
    ///
    /// The returned completion resolves once `f` has run, and is cancelled if
    /// the loop is stopped or `f` panics.
    pub fn run_later(&self, f: impl FnOnce() + Send + 'static) -> Completion<()> {
        let done = Completion::new();
        let job_done = CancelOnDrop(done.clone());
        let name = self.inner.name.clone();
        let posted = self.post(Box::new(move || {
            let job_done = job_done;
            match catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => {
                    job_done.0.resolve(());
                }
                Err(_) => {
                    error!(event_loop = %name, "Posted job panicked");
                }
            }
        }));
        if posted.is_err() {
            done.cancel();
        }
        done
    }

    /// Run `f` on the loop once `delay` has elapsed
    pub fn run_delayed(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerHandle {
        let name = self.inner.name.clone();
        let task = self.inner.handle.spawn(async move {
            sleep(delay).await;
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                error!(event_loop = %name, "Delayed job panicked");
            }
        });
        TimerHandle {
            abort: task.abort_handle(),
        }
    }

    /// Run `f` on the loop every `period` until the timer is cancelled
    pub fn run_periodic(
        &self,
        period: Duration,
        mut f: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        let name = self.inner.name.clone();
        let task = self.inner.handle.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if catch_unwind(AssertUnwindSafe(&mut f)).is_err() {
                    error!(event_loop = %name, "Periodic job panicked");
                }
            }
        });
        TimerHandle {
            abort: task.abort_handle(),
        }
    }

    /// Stop the loop after the job currently running
    ///
    /// Jobs still queued are dropped. Joins the loop thread unless called
    /// from it.
    pub fn stop(&self) {
        let _ = self.inner.tx.send(Message::Stop);
        if self.is_current() {
            return;
        }
        if let Some(thread) = lock(&self.inner.thread).take() {
            if thread.join().is_err() {
                error!(event_loop = %self.inner.name, "Event loop thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_job(name: &str, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(event_loop = %name, "Event loop job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CompletionError;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_marshal_runs_on_loop_thread() {
        let event_loop = EventLoop::start("test-loop").unwrap();
        assert!(!event_loop.is_current());

        let inner = event_loop.clone();
        let on_loop = event_loop.run_now_or_marshal(move || inner.is_current()).unwrap();
        assert!(on_loop);
        event_loop.stop();
        assert!(!event_loop.is_running());
    }

    #[test]
    fn test_nested_marshal_runs_inline() {
        let event_loop = EventLoop::start("test-nested").unwrap();
        let inner = event_loop.clone();
        let value = event_loop
            .run_now_or_marshal(move || inner.run_now_or_marshal(|| 7).unwrap())
            .unwrap();
        assert_eq!(value, 7);
        event_loop.stop();
    }

    #[test]
    fn test_jobs_run_in_order() {
        let event_loop = EventLoop::start("test-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut last = None;
        for i in 0..10 {
            let seen = seen.clone();
            last = Some(event_loop.run_later(move || seen.lock().unwrap().push(i)));
        }
        last.unwrap().result(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        event_loop.stop();
    }

    #[test]
    fn test_panicking_job_does_not_kill_loop() {
        let event_loop = EventLoop::start("test-panic").unwrap();
        let failed = event_loop.run_later(|| panic!("boom"));
        assert!(failed.result(Some(Duration::from_secs(2))).is_err());

        let value = event_loop.run_now_or_marshal(|| 3).unwrap();
        assert_eq!(value, 3);
        event_loop.stop();
    }

    #[test]
    fn test_periodic_and_delayed() {
        let event_loop = EventLoop::start("test-timers").unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        let periodic = event_loop.run_periodic(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let fired = Completion::new();
        let signal = fired.clone();
        event_loop.run_delayed(Duration::from_millis(30), move || {
            signal.resolve(());
        });

        fired.result(Some(Duration::from_secs(2))).unwrap();
        periodic.cancel();
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        event_loop.stop();
    }

    #[test]
    fn test_jobs_queued_behind_stop_are_cancelled() {
        let event_loop = EventLoop::start("test-stop-queued").unwrap();
        let slow = event_loop.run_later(|| thread::sleep(Duration::from_millis(200)));

        let stopper = event_loop.clone();
        let stopping = thread::spawn(move || stopper.stop());
        thread::sleep(Duration::from_millis(50));

        let dropped = event_loop.run_later(|| ());
        assert_eq!(
            dropped.result(Some(Duration::from_secs(2))),
            Err(CompletionError::Cancelled)
        );
        assert!(dropped.cancelled());
        stopping.join().unwrap();
        assert!(slow.result(Some(Duration::from_secs(2))).is_ok());
    }

    #[test]
    fn test_stopped_loop_rejects_jobs() {
        let event_loop = EventLoop::start("test-stopped").unwrap();
        event_loop.stop();
        assert!(event_loop.run_now_or_marshal(|| ()).is_err());
        assert!(event_loop.run_later(|| ()).cancelled());
    }
}
