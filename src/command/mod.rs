//! Command and state expectations
//!
//! This module handles:
//! - Sending commands through the registered command sender
//! - Waiting for the device acknowledgement of a command
//! - Waiting for protocol events carrying expected arguments
//! - Checking the last known state of the device

mod expectations;
mod message;
mod request;

pub use expectations::{expect, EventExpectation, StateExpectation};
pub use message::{AckStatus, CommandMessage};
pub use request::{Command, CommandExpectation};
