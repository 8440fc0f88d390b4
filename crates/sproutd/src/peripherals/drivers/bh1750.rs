//! ROHM BH1750 ambient light sensor.

use super::bus_address;
use crate::bus::{BusAddress, BusRouter};
use crate::peripherals::driver::{PeripheralDriver, Readings};
use async_trait::async_trait;
use sprout_shared::{ConfigError, DriverError, PeripheralSetup, VariableValue};
use std::sync::Arc;
use std::time::Duration;

const POWER_DOWN: u8 = 0x00;
const POWER_ON: u8 = 0x01;
const RESET: u8 = 0x07;
const ONE_TIME_HIGH_RES: u8 = 0x20;

const MEASUREMENT_TIME: Duration = Duration::from_millis(180);

/// Counts per lux at the default measurement time.
const COUNTS_PER_LUX: f64 = 1.2;

pub const ILLUMINANCE: &str = "illuminance_lux";

pub struct Bh1750Driver {
    name: String,
    router: Arc<BusRouter>,
    address: BusAddress,
}

impl Bh1750Driver {
    pub fn new(name: impl Into<String>, router: Arc<BusRouter>, address: BusAddress) -> Self {
        Self {
            name: name.into(),
            router,
            address,
        }
    }

    pub fn from_setup(
        setup: &PeripheralSetup,
        router: Arc<BusRouter>,
    ) -> Result<Box<dyn PeripheralDriver>, ConfigError> {
        let address = bus_address(setup)?;
        Ok(Box::new(Self::new(&setup.name, router, address)))
    }
}

#[async_trait]
impl PeripheralDriver for Bh1750Driver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self) -> Result<(), DriverError> {
        let handle = self.router.acquire(&self.address).await?;
        handle.write(&[POWER_ON]).await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Readings, DriverError> {
        let handle = self.router.acquire(&self.address).await?;
        // One-time mode powers down after each conversion
        handle.write(&[POWER_ON]).await?;
        handle.write(&[ONE_TIME_HIGH_RES]).await?;
        tokio::time::sleep(MEASUREMENT_TIME).await;
        let bytes = handle.read(2).await?;
        drop(handle);

        let raw = match bytes.as_slice() {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            other => {
                return Err(DriverError::Protocol {
                    driver: self.name.clone(),
                    reason: format!("expected 2 bytes, got {}", other.len()),
                })
            }
        };

        let lux = (raw as f64 / COUNTS_PER_LUX * 10.0).round() / 10.0;
        let mut readings = Readings::new();
        readings.insert(ILLUMINANCE.to_string(), VariableValue::Number(lux));
        Ok(readings)
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        let handle = self.router.acquire(&self.address).await?;
        handle.write(&[POWER_ON]).await?;
        handle.write(&[RESET]).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        let handle = self.router.acquire(&self.address).await?;
        handle.write(&[POWER_DOWN]).await?;
        Ok(())
    }
}
