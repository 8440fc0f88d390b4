//! Peripheral failure supervision.
//!
//! Bounded retry with exponential backoff for individual driver calls, and
//! a fault breaker that escalates a run of failed polls into a reported
//! fault for that one peripheral.

pub mod backoff;
pub mod breaker;

pub use backoff::{BackoffConfig, BackoffState};
pub use breaker::{FaultBreaker, FaultState};
