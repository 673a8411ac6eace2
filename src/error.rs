//! Library error type

use thiserror::Error;

/// Errors raised by the execution contexts and the scheduler
#[derive(Error, Debug)]
pub enum Error {
    #[error("Event loop '{0}' is not running")]
    LoopStopped(String),

    #[error("Job panicked on event loop '{0}'")]
    JobPanicked(String),

    #[error("Failed to spawn event loop thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to build event loop runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
