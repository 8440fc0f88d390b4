//! Shared types for the Sprout grow controller.
//!
//! Document models (recipes, peripheral setups, events), the variable value
//! type exchanged through the store, and the error taxonomy used by every
//! component of `sproutd`.

pub mod error;
pub mod event;
pub mod peripheral;
pub mod recipe;
pub mod variable;

pub use error::{BusError, ConfigError, DriverError, SchedulerError, ValidationError};
pub use event::{EventDefinition, EventValueSpec, PeripheralEvent, ValueKind};
pub use peripheral::{Communication, PeripheralKind, PeripheralSetup};
pub use recipe::{Cycle, Environment, Phase, Recipe};
pub use variable::VariableValue;

/// Version of the shared crate, reported in status output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
