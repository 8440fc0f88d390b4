//! Error types for Sprout.

use crate::event::ValueKind;
use thiserror::Error;

/// Malformed or internally inconsistent recipe/setup document.
///
/// Fatal at load time: nothing is started when one of these is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Malformed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid recipe schedule: {0}")]
    Schedule(#[from] SchedulerError),

    #[error("Peripheral '{peripheral}': invalid communication field '{field}': {reason}")]
    InvalidCommunication {
        peripheral: String,
        field: String,
        reason: String,
    },

    #[error("Peripheral '{peripheral}': {reason}")]
    InvalidSetup { peripheral: String, reason: String },

    #[error("No driver registered for module '{module_name}', class '{class_name}'")]
    UnknownDriver {
        module_name: String,
        class_name: String,
    },

    #[error("Peripheral '{0}' is declared more than once")]
    DuplicatePeripheral(String),
}

/// Malformed phase/cycle structure, detected while loading a recipe, or a
/// scheduler driven out of order.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Recipe has no phases")]
    NoPhases,

    #[error("Phase '{phase}' has no cycles")]
    EmptyPhase { phase: String },

    #[error("Cycle '{cycle}' in phase '{phase}' has non-positive duration {duration_hours}h")]
    NonPositiveDuration {
        phase: String,
        cycle: String,
        duration_hours: f64,
    },

    #[error("Cycle '{cycle}' in phase '{phase}' references undefined environment '{environment}'")]
    UnknownEnvironment {
        phase: String,
        cycle: String,
        environment: String,
    },

    #[error("Phase '{phase}' is too long to schedule")]
    ScheduleTooLong { phase: String },

    #[error("Recipe '{0}' was already started")]
    AlreadyStarted(String),
}

/// Transaction-level bus failure. The router never retries these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Bus transaction timed out after {timeout_ms}ms on {segment}")]
    Timeout { segment: String, timeout_ms: u64 },

    #[error("No acknowledge from device 0x{address:02x} on bus {bus}")]
    Nack { bus: u8, address: u8 },

    #[error("Bus I/O error: {0}")]
    Io(String),

    #[error("Peripheral has no routable bus address")]
    Unroutable,
}

/// Failure inside a peripheral driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("{driver}: protocol error: {reason}")]
    Protocol { driver: String, reason: String },

    #[error("{driver} does not support {operation}")]
    Unsupported { driver: String, operation: String },

    #[error("Invalid value for output '{variable}': {reason}")]
    InvalidOutput { variable: String, reason: String },
}

impl DriverError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Bus(_) | Self::Protocol { .. })
    }
}

/// Rejected command. Peripheral state is left unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Peripheral '{peripheral}' does not support event '{event}'")]
    UnsupportedEvent { peripheral: String, event: String },

    #[error("Event '{event}' expects a {expected} value, got {got}")]
    InvalidValue {
        event: String,
        expected: ValueKind,
        got: String,
    },

    #[error("Event '{event}': {reason}")]
    OutOfRange { event: String, reason: String },

    #[error("Peripheral '{peripheral}' must be in manual mode to accept '{event}'")]
    ManualModeRequired { peripheral: String, event: String },

    #[error("Peripheral '{peripheral}' cannot go from {from} to {to}")]
    InvalidTransition {
        peripheral: String,
        from: String,
        to: String,
    },

    #[error("Peripheral '{peripheral}' rejected '{event}': {reason}")]
    CommandFailed {
        peripheral: String,
        event: String,
        reason: String,
    },

    #[error("Peripheral '{0}' is not running")]
    PeripheralUnavailable(String),

    #[error("Unknown peripheral '{0}'")]
    UnknownPeripheral(String),
}
