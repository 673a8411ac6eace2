//! Command expectations
//!
//! A [`CommandExpectation`] sends its command when scheduled and resolves
//! with the device acknowledgement. Armed as a subscriber filter it sends
//! nothing and matches the echo of the same command instead.

use super::message::{AckStatus, CommandMessage};
use crate::expectation::{Expectation, Matcher, Verdict};
use crate::runtime::Completion;
use crate::scheduler::Scheduler;
use skyctl_shared::{defaults, match_args, Args, Event, EventContext, ExpectPolicy};
use std::time::Duration;
use tracing::{debug, warn};

/// Leaf expectation sending a command and waiting for its acknowledgement
pub struct CommandExpectation {
    message: CommandMessage,
    lifecycle: bool,
    float_tol: f64,
    ack: Option<Completion<AckStatus>>,
    matched: Option<Event>,
}

impl CommandExpectation {
    pub fn new(message: CommandMessage) -> Self {
        Self {
            message,
            lifecycle: false,
            float_tol: defaults::FLOAT_TOLERANCE,
            ack: None,
            matched: None,
        }
    }

    /// Exempt the command from the connection veto (connect, disconnect)
    pub fn lifecycle(mut self) -> Self {
        self.lifecycle = true;
        self
    }

    pub fn float_tol(mut self, float_tol: f64) -> Self {
        self.float_tol = float_tol;
        self
    }

    pub fn message(&self) -> &CommandMessage {
        &self.message
    }

    fn ack_verdict(&mut self) -> Verdict {
        let Some(ack) = &self.ack else {
            return Verdict::Pending;
        };
        match ack.peek() {
            None => Verdict::Pending,
            Some(Ok(status)) if status.is_positive() => {
                self.matched = Some(self.message.to_event().with_policy(ExpectPolicy::Wait));
                Verdict::Matched
            }
            Some(Ok(status)) => {
                Verdict::Failed(format!("{} not acknowledged: {}", self.message.name, status))
            }
            Some(Err(_)) => Verdict::Cancelled,
        }
    }
}

impl Matcher for CommandExpectation {
    fn check(&mut self, event: &Event) -> Verdict {
        if self.ack.is_some() {
            return self.ack_verdict();
        }
        if event.name() == self.message.name
            && match_args(event.args(), &self.message.args, self.float_tol)
        {
            self.matched = Some(event.clone());
            return Verdict::Matched;
        }
        Verdict::Pending
    }

    fn schedule(&mut self, scheduler: &Scheduler) -> Verdict {
        match scheduler.contexts().send_command(&self.message) {
            None => {
                warn!(
                    scheduler = scheduler.name(),
                    command = %self.message,
                    "No context can send commands"
                );
                Verdict::Failed(format!("Cannot send {}: no command sender", self.message.name))
            }
            Some(Err(err)) => {
                warn!(
                    scheduler = scheduler.name(),
                    command = %self.message,
                    error = %err,
                    "Failed to send command"
                );
                Verdict::Failed(format!("Failed to send {}: {}", self.message.name, err))
            }
            Some(Ok(ack)) => {
                debug!(scheduler = scheduler.name(), command = %self.message, "Command sent");
                scheduler.wake_on(&ack);
                self.ack = Some(ack);
                self.ack_verdict()
            }
        }
    }

    fn poll(&mut self) -> Verdict {
        self.ack_verdict()
    }

    fn cancel(&mut self) {
        if let Some(ack) = &self.ack {
            ack.cancel();
        }
    }

    fn expected(&self) -> EventContext {
        EventContext::from_events([self.message.to_event()])
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
        Box::new(Self {
            message: self.message.clone(),
            lifecycle: self.lifecycle,
            float_tol: self.float_tol,
            ack: None,
            matched: None,
        })
    }

    fn name(&self) -> String {
        self.message.name.clone()
    }

    fn is_lifecycle(&self) -> bool {
        self.lifecycle
    }

    fn is_device(&self) -> bool {
        true
    }

    fn explain(&self) -> Option<String> {
        let ack = self.ack.as_ref()?;
        match ack.peek() {
            Some(Ok(status)) if !status.is_positive() => {
                Some(format!("[ ]{} ({})", self.message, status))
            }
            _ => None,
        }
    }
}

/// Builder for a command and what it should bring about
///
/// ```ignore
/// let takeoff = scheduler.schedule(
///     Command::new("TakeOff", args! {})
///         .with_timeout(Duration::from_secs(5))
///         .expecting(expect("FlyingState", args! { "state" => "hovering" }, ExpectPolicy::Wait)),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    message: CommandMessage,
    lifecycle: bool,
    timeout: Option<Duration>,
    float_tol: f64,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Args) -> Self {
        Self {
            message: CommandMessage::new(name, args),
            lifecycle: false,
            timeout: None,
            float_tol: defaults::FLOAT_TOLERANCE,
        }
    }

    /// Connection lifecycle command, allowed while disconnected
    pub fn lifecycle(name: impl Into<String>, args: Args) -> Self {
        Self {
            lifecycle: true,
            ..Self::new(name, args)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn float_tol(mut self, float_tol: f64) -> Self {
        self.float_tol = float_tol;
        self
    }

    pub fn message(&self) -> &CommandMessage {
        &self.message
    }

    fn matcher(&self) -> CommandExpectation {
        let matcher = CommandExpectation::new(self.message.clone()).float_tol(self.float_tol);
        if self.lifecycle {
            matcher.lifecycle()
        } else {
            matcher
        }
    }

    /// The command acknowledgement alone
    pub fn expectation(&self) -> Expectation {
        let expectation = Expectation::from_matcher(self.matcher());
        match self.timeout {
            Some(timeout) => expectation.with_timeout(timeout),
            None => expectation,
        }
    }

    /// The acknowledgement and `reply`, with the timeout on the whole group
    pub fn expecting(&self, reply: Expectation) -> Expectation {
        let group = Expectation::all_of([Expectation::from_matcher(self.matcher()), reply]);
        match self.timeout {
            Some(timeout) => group.with_timeout(timeout),
            None => group,
        }
    }
}

impl From<Command> for Expectation {
    fn from(command: Command) -> Self {
        command.expectation()
    }
}

impl From<CommandExpectation> for Expectation {
    fn from(matcher: CommandExpectation) -> Self {
        Expectation::from_matcher(matcher)
    }
}
