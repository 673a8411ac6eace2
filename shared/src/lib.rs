//! skyctl shared types
//!
//! This crate provides the event model shared by every layer of the
//! controller library: decoded protocol events, their arguments, and the
//! collections expectations use to report what they matched.

pub mod event;
pub mod value;

use std::time::{SystemTime, UNIX_EPOCH};

pub use event::{Combine, Event, EventContext, EventKey, EventMarker, ExpectPolicy};
pub use value::{match_args, ArgValue, Args, ValueError};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default tuning parameters
pub mod defaults {
    /// Period of the scheduler timeout sweep in milliseconds
    pub const SWEEP_PERIOD_MS: u64 = 15;

    /// Subscriber event queue size before the oldest events are dropped
    pub const SUBSCRIBER_QUEUE_SIZE: usize = 1024;

    /// Time `unsubscribe` waits for an in-flight callback, in milliseconds
    pub const SUBSCRIBER_TIMEOUT_MS: u64 = 10_000;

    /// Capacity of the admission control FIFO
    pub const STREAM_QUEUE_CAPACITY: usize = 1024;

    /// Absolute tolerance used when comparing float arguments
    pub const FLOAT_TOLERANCE: f64 = 1e-7;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_args_macro() {
        let args = args! { "state" => "hovering", "alt" => 2.5 };
        assert_eq!(args.len(), 2);
        assert_eq!(args["alt"], ArgValue::Float(2.5));
    }
}
