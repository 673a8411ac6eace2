//! Connection state as seen by the scheduler
//!
//! This module handles:
//! - Tracking whether a device is connected
//! - Vetoing expectations that need a device while disconnected

mod guard;

pub use guard::{ConnectionGuard, ConnectionState};
