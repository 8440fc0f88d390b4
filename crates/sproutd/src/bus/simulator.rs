//! In-memory I2C backend.
//!
//! Models multiplexers (TCA9548A style: one control byte, one bit per
//! channel) and a few register-level devices so drivers run their real
//! byte protocol without hardware. Devices behind a mux only answer while
//! their channel is selected.

use super::{BusAddress, I2cBackend};
use crate::peripherals::drivers::sht40::crc8;
use async_trait::async_trait;
use sprout_shared::BusError;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// A simulated bus device.
pub trait SimulatedDevice: Any + Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError>;
    fn read(&mut self, len: usize) -> Result<Vec<u8>, BusError>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Location {
    bus: u8,
    mux: Option<u8>,
    channel: Option<u8>,
    address: u8,
}

#[derive(Default)]
struct SimState {
    devices: HashMap<Location, Box<dyn SimulatedDevice>>,
    muxes: HashSet<(u8, u8)>,
    /// Channel bitmask per (bus, mux)
    selected: HashMap<(u8, u8), u8>,
    /// Remaining injected I/O failures per (bus, address)
    failures: HashMap<(u8, u8), u32>,
    offline: HashSet<(u8, u8)>,
}

impl SimState {
    fn locate(&mut self, bus: u8, address: u8) -> Option<&mut Box<dyn SimulatedDevice>> {
        let routed = self.selected.iter().find_map(|(&(b, mux), &mask)| {
            if b != bus {
                return None;
            }
            (0..8u8)
                .filter(|ch| mask & (1 << ch) != 0)
                .map(|ch| Location {
                    bus,
                    mux: Some(mux),
                    channel: Some(ch),
                    address,
                })
                .find(|loc| self.devices.contains_key(loc))
        });

        let location = routed.unwrap_or(Location {
            bus,
            mux: None,
            channel: None,
            address,
        });
        self.devices.get_mut(&location)
    }

    fn check_faults(&mut self, bus: u8, address: u8) -> Result<(), BusError> {
        if self.offline.contains(&(bus, address)) {
            return Err(BusError::Nack { bus, address });
        }
        if let Some(remaining) = self.failures.get_mut(&(bus, address)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::Io(format!(
                    "injected failure on bus {} addr 0x{:02x}",
                    bus, address
                )));
            }
        }
        Ok(())
    }
}

/// Simulated I2C controller.
#[derive(Default)]
pub struct SimulatedBus {
    state: Mutex<SimState>,
    latency: Mutex<Duration>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mux(&self, bus: u8, address: u8) {
        self.lock().muxes.insert((bus, address));
    }

    /// Place a device. Addresses without a bus are ignored.
    pub fn add_device(&self, address: BusAddress, device: impl SimulatedDevice) {
        let (Some(bus), Some(addr)) = (address.bus, address.address) else {
            return;
        };
        let location = Location {
            bus,
            mux: address.mux,
            channel: address.channel,
            address: addr,
        };
        self.lock().devices.insert(location, Box::new(device));
    }

    /// Fail the next `count` operations on a device with an I/O error.
    pub fn fail_next(&self, bus: u8, address: u8, count: u32) {
        self.lock().failures.insert((bus, address), count);
    }

    /// Make a device stop (or resume) acknowledging.
    pub fn set_offline(&self, bus: u8, address: u8, offline: bool) {
        let mut state = self.lock();
        if offline {
            state.offline.insert((bus, address));
        } else {
            state.offline.remove(&(bus, address));
        }
    }

    /// Delay applied to every operation.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub fn selected_channels(&self, bus: u8, mux: u8) -> Option<u8> {
        self.lock().selected.get(&(bus, mux)).copied()
    }

    /// Inspect or adjust a device model in place.
    pub fn with_device<D: SimulatedDevice, R>(
        &self,
        address: BusAddress,
        f: impl FnOnce(&mut D) -> R,
    ) -> Option<R> {
        let location = Location {
            bus: address.bus?,
            mux: address.mux,
            channel: address.channel,
            address: address.address?,
        };
        let mut state = self.lock();
        let device = state.devices.get_mut(&location)?;
        device.as_any_mut().downcast_mut::<D>().map(f)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl I2cBackend for SimulatedBus {
    async fn write(&self, bus: u8, address: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.delay().await;
        let mut state = self.lock();
        state.check_faults(bus, address)?;

        if state.muxes.contains(&(bus, address)) {
            let mask = bytes.first().copied().unwrap_or(0);
            state.selected.insert((bus, address), mask);
            return Ok(());
        }

        match state.locate(bus, address) {
            Some(device) => device.write(bytes),
            None => Err(BusError::Nack { bus, address }),
        }
    }

    async fn read(&self, bus: u8, address: u8, len: usize) -> Result<Vec<u8>, BusError> {
        self.delay().await;
        let mut state = self.lock();
        state.check_faults(bus, address)?;

        if state.muxes.contains(&(bus, address)) {
            let mask = state.selected.get(&(bus, address)).copied().unwrap_or(0);
            return Ok(vec![mask; len]);
        }

        match state.locate(bus, address) {
            Some(device) => device.read(len),
            None => Err(BusError::Nack { bus, address }),
        }
    }
}

/// SHT40 temperature/humidity sensor.
#[derive(Debug, Clone)]
pub struct Sht40Sim {
    pub temperature_celsius: f64,
    pub humidity_percent: f64,
    pending: Option<[u8; 6]>,
}

impl Sht40Sim {
    pub fn new(temperature_celsius: f64, humidity_percent: f64) -> Self {
        Self {
            temperature_celsius,
            humidity_percent,
            pending: None,
        }
    }

    fn measurement(&self) -> [u8; 6] {
        let t_ticks = ((self.temperature_celsius + 45.0) * 65535.0 / 175.0).round() as u16;
        let rh_ticks = ((self.humidity_percent + 6.0) * 65535.0 / 125.0).round() as u16;
        let t = t_ticks.to_be_bytes();
        let rh = rh_ticks.to_be_bytes();
        [t[0], t[1], crc8(&t), rh[0], rh[1], crc8(&rh)]
    }
}

impl SimulatedDevice for Sht40Sim {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        match bytes.first() {
            Some(0xFD) | Some(0xF6) | Some(0xE0) => {
                self.pending = Some(self.measurement());
                Ok(())
            }
            Some(0x94) => {
                self.pending = None;
                Ok(())
            }
            other => Err(BusError::Io(format!("sht40: unknown command {:?}", other))),
        }
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, BusError> {
        let data = self
            .pending
            .take()
            .ok_or_else(|| BusError::Io("sht40: no measurement pending".to_string()))?;
        Ok(data.iter().copied().take(len).collect())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// BH1750 ambient light sensor.
#[derive(Debug, Clone)]
pub struct Bh1750Sim {
    pub lux: f64,
    powered: bool,
    pending: Option<[u8; 2]>,
}

impl Bh1750Sim {
    pub fn new(lux: f64) -> Self {
        Self {
            lux,
            powered: false,
            pending: None,
        }
    }
}

impl SimulatedDevice for Bh1750Sim {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        match bytes.first() {
            Some(0x00) => {
                self.powered = false;
                Ok(())
            }
            Some(0x01) => {
                self.powered = true;
                Ok(())
            }
            Some(0x07) => {
                self.pending = None;
                Ok(())
            }
            Some(0x20) if self.powered => {
                let raw = (self.lux * 1.2).round().clamp(0.0, u16::MAX as f64) as u16;
                self.pending = Some(raw.to_be_bytes());
                self.powered = false;
                Ok(())
            }
            other => Err(BusError::Io(format!("bh1750: unexpected command {:?}", other))),
        }
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, BusError> {
        let data = self
            .pending
            .take()
            .ok_or_else(|| BusError::Io("bh1750: no measurement pending".to_string()))?;
        Ok(data.iter().copied().take(len).collect())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// MCP23017 16-bit GPIO expander (BANK = 0 register layout).
#[derive(Debug, Clone)]
pub struct Mcp23017Sim {
    registers: [u8; 0x16],
    pointer: u8,
}

impl Mcp23017Sim {
    pub fn new() -> Self {
        let mut registers = [0u8; 0x16];
        // IODIRA/IODIRB reset to all inputs
        registers[0x00] = 0xFF;
        registers[0x01] = 0xFF;
        Self { registers, pointer: 0 }
    }

    pub fn register(&self, register: u8) -> u8 {
        self.registers.get(register as usize).copied().unwrap_or(0)
    }

    fn store(&mut self, register: u8, value: u8) {
        if let Some(slot) = self.registers.get_mut(register as usize) {
            *slot = value;
        }
        // Writing GPIOx writes the output latch OLATx
        match register {
            0x12 => self.registers[0x14] = value,
            0x13 => self.registers[0x15] = value,
            _ => {}
        }
    }
}

impl Default for Mcp23017Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice for Mcp23017Sim {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        let (&register, data) = bytes
            .split_first()
            .ok_or_else(|| BusError::Io("mcp23017: empty write".to_string()))?;
        if register as usize >= self.registers.len() {
            return Err(BusError::Io(format!("mcp23017: no register 0x{:02x}", register)));
        }
        self.pointer = register;
        for (offset, value) in data.iter().enumerate() {
            self.store(register.wrapping_add(offset as u8), *value);
        }
        Ok(())
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, BusError> {
        Ok((0..len)
            .map(|i| self.register(self.pointer.wrapping_add(i as u8)))
            .collect())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_device_behind_mux_needs_channel() {
        let sim = SimulatedBus::new();
        sim.add_mux(2, 0x77);
        sim.add_device(BusAddress::new(2, Some(0x77), Some(3), 0x44), Sht40Sim::new(20.0, 50.0));

        assert_eq!(
            sim.write(2, 0x44, &[0xFD]).await,
            Err(BusError::Nack { bus: 2, address: 0x44 })
        );

        sim.write(2, 0x77, &[1 << 3]).await.unwrap();
        sim.write(2, 0x44, &[0xFD]).await.unwrap();
        assert_eq!(sim.read(2, 0x44, 6).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let sim = SimulatedBus::new();
        sim.add_device(BusAddress::new(1, None, None, 0x20), Mcp23017Sim::new());
        sim.fail_next(1, 0x20, 2);

        assert!(matches!(sim.read(1, 0x20, 1).await, Err(BusError::Io(_))));
        assert!(matches!(sim.read(1, 0x20, 1).await, Err(BusError::Io(_))));
        assert!(sim.read(1, 0x20, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_device_nacks() {
        let sim = SimulatedBus::new();
        sim.add_device(BusAddress::new(1, None, None, 0x23), Bh1750Sim::new(100.0));
        sim.set_offline(1, 0x23, true);
        assert_eq!(
            sim.write(1, 0x23, &[0x01]).await,
            Err(BusError::Nack { bus: 1, address: 0x23 })
        );
        sim.set_offline(1, 0x23, false);
        assert!(sim.write(1, 0x23, &[0x01]).await.is_ok());
    }

    #[test]
    fn test_mcp23017_gpio_write_latches_output() {
        let mut mcp = Mcp23017Sim::new();
        mcp.write(&[0x12, 0b0000_1000]).unwrap();
        assert_eq!(mcp.register(0x14), 0b0000_1000);

        mcp.write(&[0x14]).unwrap();
        assert_eq!(mcp.read(1).unwrap(), vec![0b0000_1000]);
    }

    #[test]
    fn test_with_device_downcasts() {
        let sim = SimulatedBus::new();
        let addr = BusAddress::new(1, None, None, 0x44);
        sim.add_device(addr, Sht40Sim::new(20.0, 50.0));

        sim.with_device::<Sht40Sim, _>(addr, |d| d.temperature_celsius = 25.0);
        let t = sim.with_device::<Sht40Sim, _>(addr, |d| d.temperature_celsius);
        assert_eq!(t, Some(25.0));
        assert_eq!(sim.with_device::<Mcp23017Sim, _>(addr, |_| ()), None);
    }
}
