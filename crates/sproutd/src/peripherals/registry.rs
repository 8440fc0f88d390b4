//! Static driver registry.
//!
//! Setup documents name their implementation by `(module_name, class_name)`.
//! The registry maps those pairs to factories; there is no dynamic loading.

use super::driver::PeripheralDriver;
use super::drivers::{Bh1750Driver, Mcp23017Driver, Sht40Driver};
use crate::bus::BusRouter;
use sprout_shared::{ConfigError, PeripheralSetup};
use std::collections::HashMap;
use std::sync::Arc;

pub type DriverFactory =
    fn(&PeripheralSetup, Arc<BusRouter>) -> Result<Box<dyn PeripheralDriver>, ConfigError>;

pub const SHT40_MODULE: &str = "device.peripherals.modules.sht40.manager";
pub const SHT40_CLASS: &str = "SHT40Manager";
pub const BH1750_MODULE: &str = "device.peripherals.modules.bh1750.manager";
pub const BH1750_CLASS: &str = "BH1750Manager";
pub const MCP23017_MODULE: &str = "device.peripherals.modules.actuator_mcp23017.manager";
pub const MCP23017_CLASS: &str = "ActuatorMCP23017Manager";

#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<(String, String), DriverFactory>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver that ships with the daemon.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(SHT40_MODULE, SHT40_CLASS, Sht40Driver::from_setup);
        registry.register(BH1750_MODULE, BH1750_CLASS, Bh1750Driver::from_setup);
        registry.register(MCP23017_MODULE, MCP23017_CLASS, Mcp23017Driver::from_setup);
        registry
    }

    /// Add or replace a factory.
    pub fn register(&mut self, module_name: &str, class_name: &str, factory: DriverFactory) {
        self.factories
            .insert((module_name.to_string(), class_name.to_string()), factory);
    }

    pub fn contains(&self, module_name: &str, class_name: &str) -> bool {
        self.factories
            .contains_key(&(module_name.to_string(), class_name.to_string()))
    }

    /// Check that a driver exists without building it.
    pub fn check(&self, setup: &PeripheralSetup) -> Result<(), ConfigError> {
        if self.contains(&setup.module_name, &setup.class_name) {
            Ok(())
        } else {
            Err(unknown(setup))
        }
    }

    /// Build the driver for a setup document.
    pub fn create(
        &self,
        setup: &PeripheralSetup,
        router: Arc<BusRouter>,
    ) -> Result<Box<dyn PeripheralDriver>, ConfigError> {
        let factory = self
            .factories
            .get(&(setup.module_name.clone(), setup.class_name.clone()))
            .ok_or_else(|| unknown(setup))?;
        factory(setup, router)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

fn unknown(setup: &PeripheralSetup) -> ConfigError {
    ConfigError::UnknownDriver {
        module_name: setup.module_name.clone(),
        class_name: setup.class_name.clone(),
    }
}
