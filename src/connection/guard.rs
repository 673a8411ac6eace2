//! Connection veto hook

use crate::expectation::Expectation;
use crate::scheduler::Context;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

/// Reason given to expectations vetoed while disconnected
pub const NOT_CONNECTED: &str = "Not connected to any device";

/// Device connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Scheduler context refusing device expectations unless connected
///
/// Lifecycle expectations (connect, disconnect) are always let through, as
/// are expectations that never reach the device. Groups are vetoed if any of
/// their device leaves is.
#[derive(Debug)]
pub struct ConnectionGuard {
    state: AtomicU8,
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionGuard {
    /// Create a guard in the disconnected state
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            info!(from = %previous, to = %state, "Connection state changed");
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.set_state(if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        });
    }

    pub fn set_connecting(&self) {
        self.set_state(ConnectionState::Connecting);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

impl Context for ConnectionGuard {
    fn schedule_hook(&self, expectation: &Expectation) -> Option<Expectation> {
        if self.is_connected() || !expectation.is_device() || expectation.is_lifecycle() {
            return None;
        }
        Some(Expectation::failure(NOT_CONNECTED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::runtime::Completion;
    use crate::testing::{event, scheduler, FakeDrone, Probe};
    use skyctl_shared::args;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_state_transitions() {
        let guard = ConnectionGuard::new();
        assert_eq!(guard.state(), ConnectionState::Disconnected);
        guard.set_connecting();
        assert!(!guard.is_connected());
        guard.set_connected(true);
        assert!(guard.is_connected());
        guard.set_connected(false);
        assert_eq!(guard.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connected_lets_commands_through() {
        let scheduler = scheduler("guard");
        let drone = FakeDrone::new();
        let guard = Arc::new(ConnectionGuard::new());
        scheduler.add_context("connection", guard.clone());
        scheduler.add_context("drone", drone.clone());

        guard.set_connecting();
        let early = scheduler.schedule(Command::new("TakeOff", args! {}).into());
        assert_eq!(early.failure_reason().as_deref(), Some(NOT_CONNECTED));
        assert_eq!(early.explain(), "Not connected to any device: [ ]TakeOff()");

        guard.set_connected(true);
        let takeoff = scheduler.schedule(Command::new("TakeOff", args! {}).into());
        assert!(takeoff.success());
        assert_eq!(drone.sent().len(), 1);
        scheduler.destroy();
    }

    #[test]
    fn test_veto_covers_groups() {
        let scheduler = scheduler("guard-groups");
        let drone = FakeDrone::new();
        let guard = Arc::new(ConnectionGuard::new());
        scheduler.add_context("connection", guard.clone());
        scheduler.add_context("drone", drone.clone());

        let connect: Expectation = Command::lifecycle("Connect", args! {}).into();
        let takeoff: Expectation = Command::new("TakeOff", args! {}).into();
        let group = scheduler.schedule(connect & takeoff);
        assert_eq!(group.failure_reason().as_deref(), Some(NOT_CONNECTED));
        assert!(drone.sent().is_empty());

        let connect = scheduler.schedule(Command::lifecycle("Connect", args! {}).into());
        assert!(connect.success());
        assert_eq!(drone.sent().len(), 1);
        scheduler.destroy();
    }

    #[test]
    fn test_local_expectations_pass_while_disconnected() {
        let scheduler = scheduler("guard-local");
        let guard = Arc::new(ConnectionGuard::new());
        scheduler.add_context("connection", guard);

        let done = scheduler.schedule(Expectation::succeeded());
        assert!(done.success());

        let probe = scheduler.schedule(Expectation::from_matcher(Probe::new("Tick")));
        assert!(!probe.is_done());
        scheduler
            .process_event(event("Tick", args! {}))
            .result(Some(Duration::from_secs(2)))
            .unwrap();
        assert!(probe.wait(Some(Duration::from_secs(2))).is_success());

        let source = Completion::new();
        let external = scheduler.schedule(Expectation::external(source.clone(), |_: &()| true));
        assert!(!external.is_done());
        source.resolve(());
        assert!(external.wait(Some(Duration::from_secs(2))).is_success());
        scheduler.destroy();
    }
}
