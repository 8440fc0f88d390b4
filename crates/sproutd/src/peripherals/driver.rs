//! Uniform driver contract.
//!
//! A driver owns the byte-level protocol of one device and nothing else: it
//! never touches the variable store and never retries. The manager decides
//! when to call it and what to do with failures.

use async_trait::async_trait;
use sprout_shared::{DriverError, VariableValue};
use std::collections::BTreeMap;

/// Driver reading name to value, e.g. `temperature_celsius -> 21.4`.
pub type Readings = BTreeMap<String, VariableValue>;

/// Store variable name to value realized (or to realize) on the device.
pub type Outputs = BTreeMap<String, VariableValue>;

#[async_trait]
pub trait PeripheralDriver: Send {
    /// Human-readable driver name for logs and errors.
    fn name(&self) -> &str;

    /// Bring the device into a known state. Called once before polling and
    /// again after every reset.
    async fn setup(&mut self) -> Result<(), DriverError>;

    /// Take one set of readings.
    async fn read(&mut self) -> Result<Readings, DriverError> {
        Err(self.unsupported("read"))
    }

    /// Drive the device to the given outputs.
    async fn write(&mut self, _outputs: &Outputs) -> Result<(), DriverError> {
        Err(self.unsupported("write"))
    }

    /// Execute an operator command and report the outputs it produced.
    async fn manual_command(
        &mut self,
        name: &str,
        _value: Option<&VariableValue>,
    ) -> Result<Outputs, DriverError> {
        Err(self.unsupported(name))
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Leave the device in a safe state.
    async fn shutdown(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn unsupported(&self, operation: &str) -> DriverError {
        DriverError::Unsupported {
            driver: self.name().to_string(),
            operation: operation.to_string(),
        }
    }
}
