//! I2C bus routing.
//!
//! Peripherals address hardware as `(bus, mux, channel, address)`. The
//! router hands out exclusive handles per `(bus, mux)` segment, so two
//! peripherals behind the same multiplexer never transact concurrently even
//! when they sit on different channels. Peripherals without a bus bypass
//! routing entirely.
//!
//! The hardware seam is [`I2cBackend`]; [`SimulatedBus`] implements it with
//! in-memory device models.

pub mod router;
pub mod simulator;

pub use router::{BusHandle, BusRouter};
pub use simulator::{SimulatedBus, SimulatedDevice};

use async_trait::async_trait;
use sprout_shared::{BusError, Communication, ConfigError};
use std::fmt;

/// Raw bus access for one physical controller family.
#[async_trait]
pub trait I2cBackend: Send + Sync {
    /// Write bytes to a device.
    async fn write(&self, bus: u8, address: u8, bytes: &[u8]) -> Result<(), BusError>;

    /// Read `len` bytes from a device.
    async fn read(&self, bus: u8, address: u8, len: usize) -> Result<Vec<u8>, BusError>;

    /// Write then read without releasing the device in between.
    async fn write_read(
        &self,
        bus: u8,
        address: u8,
        bytes: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, BusError> {
        self.write(bus, address, bytes).await?;
        self.read(bus, address, len).await
    }
}

/// Where a peripheral lives. `None` fields were declared `"none"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BusAddress {
    pub bus: Option<u8>,
    pub mux: Option<u8>,
    pub channel: Option<u8>,
    pub address: Option<u8>,
}

/// The unit of serialization: one bus, optionally behind one mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub bus: u8,
    pub mux: Option<u8>,
}

impl BusAddress {
    pub fn new(bus: u8, mux: Option<u8>, channel: Option<u8>, address: u8) -> Self {
        Self {
            bus: Some(bus),
            mux,
            channel,
            address: Some(address),
        }
    }

    /// Direct (unrouted) access, e.g. memory-mapped GPIO.
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn from_communication(comm: &Communication, peripheral: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            bus: comm.bus(peripheral)?,
            mux: comm.mux(peripheral)?,
            channel: comm.channel(peripheral)?,
            address: comm.address(peripheral)?,
        })
    }

    pub fn segment(&self) -> Option<Segment> {
        self.bus.map(|bus| Segment { bus, mux: self.mux })
    }

    pub fn is_direct(&self) -> bool {
        self.bus.is_none()
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.bus, self.address) {
            (Some(bus), Some(address)) => {
                write!(f, "bus {}", bus)?;
                if let (Some(mux), Some(channel)) = (self.mux, self.channel) {
                    write!(f, " mux 0x{:02x} ch {}", mux, channel)?;
                }
                write!(f, " addr 0x{:02x}", address)
            }
            (Some(bus), None) => write!(f, "bus {} (no address)", bus),
            _ => write!(f, "direct"),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mux {
            Some(mux) => write!(f, "bus {} mux 0x{:02x}", self.bus, mux),
            None => write!(f, "bus {}", self.bus),
        }
    }
}
