//! Built-in device drivers.

pub mod bh1750;
pub mod mcp23017;
pub mod sht40;

pub use bh1750::Bh1750Driver;
pub use mcp23017::Mcp23017Driver;
pub use sht40::Sht40Driver;

use crate::bus::BusAddress;
use sprout_shared::{ConfigError, PeripheralSetup};

/// Address of a bus-attached device. Direct access is not an option for
/// these parts.
pub(crate) fn bus_address(setup: &PeripheralSetup) -> Result<BusAddress, ConfigError> {
    let address = BusAddress::from_communication(&setup.parameters.communication, &setup.name)?;
    if address.bus.is_none() || address.address.is_none() {
        return Err(ConfigError::InvalidSetup {
            peripheral: setup.name.clone(),
            reason: "driver needs a bus and an address".to_string(),
        });
    }
    Ok(address)
}
