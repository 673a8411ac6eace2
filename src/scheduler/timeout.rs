//! Background timeout sweep for pending expectations

use super::dispatcher::{Scheduler, WeakScheduler};
use crate::runtime::{EventLoop, TimerHandle};
use std::time::Duration;

/// Periodically expires pending expectations past their deadline
///
/// Without it an expectation whose reply never comes would only time out on
/// the next incoming event.
pub(crate) struct TimeoutSweeper {
    scheduler: WeakScheduler,
    check_interval: Duration,
}

impl TimeoutSweeper {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.downgrade(),
            check_interval: scheduler.config().sweep_period,
        }
    }

    /// Start sweeping on `event_loop` until the returned handle is cancelled
    pub fn start(self, event_loop: &EventLoop) -> TimerHandle {
        let scheduler = self.scheduler;
        event_loop.run_periodic(self.check_interval, move || {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.collect();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expectation::Expectation;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::Probe;

    #[test]
    fn test_sweep_period_from_config() {
        let scheduler = Scheduler::new(SchedulerConfig {
            name: "sweep-config".to_string(),
            sweep_period: Duration::from_millis(5),
            ..Default::default()
        })
        .unwrap();
        let sweeper = TimeoutSweeper::new(&scheduler);
        assert_eq!(sweeper.check_interval, Duration::from_millis(5));

        let expectation = scheduler.schedule(
            Expectation::from_matcher(Probe::new("Never")).with_timeout(Duration::from_millis(20)),
        );
        std::thread::sleep(Duration::from_millis(200));
        assert!(expectation.timed_out());
        assert_eq!(scheduler.pending_count(), 0);
        scheduler.destroy();
    }
}
