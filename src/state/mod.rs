//! Last known device state
//!
//! The [`StateStore`] context observes every event dispatched by a scheduler
//! and keeps the latest one per correlation key, answering the state queries
//! of check-policy expectations.

mod store;

pub use store::StateStore;
