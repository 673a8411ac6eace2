//! Outgoing command and acknowledgement status

use skyctl_shared::{Args, Event};
use std::fmt;

/// A command to send to the device
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub name: String,
    pub args: Args,
}

impl CommandMessage {
    pub fn new(name: impl Into<String>, args: Args) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// The event the device echoes back for this command
    pub fn to_event(&self) -> Event {
        Event::message(self.name.clone(), self.args.clone())
    }
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_event())
    }
}

/// Acknowledgement returned by the device for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// Command received, execution not started
    Received,
    /// Command accepted, executing
    Accepted,
    /// Command executed
    Completed,
    /// Command accepted but execution failed
    Failed,
    /// Command refused (invalid state, bad arguments)
    Rejected,
    /// Command arrived too late to be executed
    Expired,
}

impl AckStatus {
    /// Whether the device took the command
    pub fn is_positive(&self) -> bool {
        matches!(self, AckStatus::Received | AckStatus::Accepted | AckStatus::Completed)
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AckStatus::Received => "received",
            AckStatus::Accepted => "accepted",
            AckStatus::Completed => "completed",
            AckStatus::Failed => "failed",
            AckStatus::Rejected => "rejected",
            AckStatus::Expired => "expired",
        };
        write!(f, "{}", label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyctl_shared::args;

    #[test]
    fn test_ack_status_polarity() {
        assert!(AckStatus::Received.is_positive());
        assert!(AckStatus::Completed.is_positive());
        assert!(!AckStatus::Rejected.is_positive());
        assert!(!AckStatus::Expired.is_positive());
    }

    #[test]
    fn test_command_display() {
        let command = CommandMessage::new("MoveTo", args! { "altitude" => 10 });
        assert_eq!(command.to_string(), "MoveTo(altitude=10)");
    }
}
