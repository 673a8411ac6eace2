//! skyctl - controller-side expectation engine
//!
//! Commands are sent and protocol events are awaited through composable
//! expectations driven by a [`Scheduler`]:
//!
//! ```ignore
//! let scheduler = Scheduler::with_name("drone")?;
//! scheduler.add_context("drone", sender);
//! let takeoff = scheduler.schedule(
//!     Command::new("TakeOff", args! {})
//!         .with_timeout(Duration::from_secs(5))
//!         .expecting(expect("FlyingState", args! { "state" => "hovering" }, ExpectPolicy::Wait)),
//! );
//! assert!(takeoff.wait(None).is_success());
//! ```

pub mod command;
pub mod connection;
pub mod error;
pub mod expectation;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod subscriber;

#[cfg(test)]
mod testing;

pub use command::{expect, AckStatus, Command, CommandMessage};
pub use connection::ConnectionGuard;
pub use error::{Error, Result};
pub use expectation::{Expectation, Matcher, Outcome, Verdict};
pub use runtime::{Completion, CompletionError, EventLoop};
pub use scheduler::{
    Context, ExpectationScheduler, Scheduler, SchedulerConfig, StreamConfig, StreamScheduler,
};
pub use state::StateStore;
pub use subscriber::{EventListener, SubscribeOptions, Subscriber};

pub use skyctl_shared::{args, Args, Event, EventContext, EventKey, ExpectPolicy};
