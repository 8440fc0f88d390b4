//! Sensirion SHT40 temperature and humidity sensor.

use super::bus_address;
use crate::bus::{BusAddress, BusRouter};
use crate::peripherals::driver::{PeripheralDriver, Readings};
use async_trait::async_trait;
use sprout_shared::{ConfigError, DriverError, PeripheralSetup, VariableValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MEASURE_HIGH_PRECISION: u8 = 0xFD;
const SOFT_RESET: u8 = 0x94;

/// Worst-case high precision conversion time.
const MEASURE_DELAY: Duration = Duration::from_millis(10);

pub const TEMPERATURE: &str = "temperature_celsius";
pub const HUMIDITY: &str = "humidity_percent";

/// CRC-8 used by Sensirion parts: polynomial 0x31, init 0xFF.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub struct Sht40Driver {
    name: String,
    router: Arc<BusRouter>,
    address: BusAddress,
}

impl Sht40Driver {
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

    fn word(&self, chunk: &[u8]) -> Result<u16, DriverError> {
        let (data, crc) = chunk.split_at(2);
        if crc8(data) != crc[0] {
            return Err(DriverError::Protocol {
                driver: self.name.clone(),
                reason: format!("crc mismatch on {:02x?}", chunk),
            });
        }
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }
}

#[async_trait]
impl PeripheralDriver for Sht40Driver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self) -> Result<(), DriverError> {
        self.reset().await
    }

    async fn read(&mut self) -> Result<Readings, DriverError> {
        let handle = self.router.acquire(&self.address).await?;
        handle.write(&[MEASURE_HIGH_PRECISION]).await?;
        tokio::time::sleep(MEASURE_DELAY).await;
        let bytes = handle.read(6).await?;
        drop(handle);

        if bytes.len() != 6 {
            return Err(DriverError::Protocol {
                driver: self.name.clone(),
                reason: format!("expected 6 bytes, got {}", bytes.len()),
            });
        }

        let t_ticks = self.word(&bytes[0..3])? as f64;
        let rh_ticks = self.word(&bytes[3..6])? as f64;

        let temperature = -45.0 + 175.0 * t_ticks / 65535.0;
        let humidity = (-6.0 + 125.0 * rh_ticks / 65535.0).clamp(0.0, 100.0);
        debug!(peripheral = %self.name, temperature, humidity, "sht40 reading");

        let mut readings = Readings::new();
        readings.insert(TEMPERATURE.to_string(), VariableValue::Number(round2(temperature)));
        readings.insert(HUMIDITY.to_string(), VariableValue::Number(round2(humidity)));
        Ok(readings)
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        let handle = self.router.acquire(&self.address).await?;
        handle.write(&[SOFT_RESET]).await?;
        Ok(())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
