//! Sprout daemon library.
//!
//! Runs a grow recipe as a schedule of environment setpoints and keeps a set
//! of I2C peripherals (sensors and actuators) synchronised with those
//! setpoints through a shared variable store.

pub mod bus;
pub mod config;
pub mod control;
pub mod daemon;
pub mod peripherals;
pub mod recipe;
pub mod store;
pub mod supervisor;

pub use daemon::{Daemon, RunStatus};
