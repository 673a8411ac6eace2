//! Test helpers: tracing setup, event builders, a probe matcher and a fake drone

use crate::command::{AckStatus, CommandMessage};
use crate::expectation::{Matcher, Verdict};
use crate::runtime::{lock, Completion};
use crate::scheduler::{CommandSender, Context, Scheduler};
use skyctl_shared::{Args, Event, EventContext};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a test-friendly tracing subscriber; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .try_init();
}

/// A running scheduler with default configuration
pub fn scheduler(name: &str) -> Scheduler {
    init_tracing();
    Scheduler::with_name(name).expect("scheduler should start")
}

/// An event correlated by its message name
pub fn event(name: &str, args: Args) -> Event {
    Event::message(name, args)
}

/// Matcher accepting any event with the given name
pub struct Probe {
    name: String,
    matched: Option<Event>,
    schedules: Arc<AtomicUsize>,
}

impl Probe {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            matched: None,
            schedules: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of `schedule` calls, shared with the probe
    pub fn schedules(&self) -> Arc<AtomicUsize> {
        self.schedules.clone()
    }
}

impl Matcher for Probe {
    fn check(&mut self, event: &Event) -> Verdict {
        if event.name() == self.name {
            self.matched = Some(event.clone());
            Verdict::Matched
        } else {
            Verdict::Pending
        }
    }

    fn schedule(&mut self, _scheduler: &Scheduler) -> Verdict {
        self.schedules.fetch_add(1, Ordering::SeqCst);
        Verdict::Pending
    }

    fn expected(&self) -> EventContext {
        EventContext::from_events([Event::message(self.name.clone(), Args::new())])
    }

    fn matched(&self) -> EventContext {
        self.matched.iter().cloned().collect()
    }

    fn unmatched(&self) -> EventContext {
        match self.matched {
            Some(_) => EventContext::new(),
            None => self.expected(),
        }
    }

    fn copy(&self) -> Box<dyn Matcher> {
        Box::new(Probe::new(&self.name))
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

enum Reply {
    Ack(Completion<AckStatus>),
    Error(String),
}

/// Command sender recording what it is asked to send
///
/// Commands are acknowledged as completed unless a reply was queued with
/// [`FakeDrone::reply_with`] or [`FakeDrone::fail_next`].
#[derive(Default)]
pub struct FakeDrone {
    sent: Mutex<Vec<CommandMessage>>,
    replies: Mutex<VecDeque<Reply>>,
}

impl FakeDrone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<CommandMessage> {
        lock(&self.sent).clone()
    }

    /// Answer the next command with `ack`
    pub fn reply_with(&self, ack: Completion<AckStatus>) {
        lock(&self.replies).push_back(Reply::Ack(ack));
    }

    /// Fail sending the next command
    pub fn fail_next(&self, reason: &str) {
        lock(&self.replies).push_back(Reply::Error(reason.to_string()));
    }
}

impl CommandSender for FakeDrone {
    fn send_command(&self, command: &CommandMessage) -> anyhow::Result<Completion<AckStatus>> {
        let reply = lock(&self.replies).pop_front();
        match reply {
            Some(Reply::Error(reason)) => anyhow::bail!(reason),
            Some(Reply::Ack(ack)) => {
                lock(&self.sent).push(command.clone());
                Ok(ack)
            }
            None => {
                lock(&self.sent).push(command.clone());
                Ok(Completion::resolved(AckStatus::Completed))
            }
        }
    }
}

impl Context for FakeDrone {
    fn command_sender(&self) -> Option<&dyn CommandSender> {
        Some(self)
    }
}
