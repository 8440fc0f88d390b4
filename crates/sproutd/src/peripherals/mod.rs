//! Peripheral layer: driver contract, built-in drivers, registry and the
//! per-peripheral manager task.

pub mod driver;
pub mod drivers;
pub mod manager;
pub mod mode;
pub mod registry;

pub use driver::{Outputs, PeripheralDriver, Readings};
pub use manager::{ManagerSettings, PeripheralHandle, PeripheralManager, PeripheralStatus};
pub use mode::Mode;
pub use registry::{DriverFactory, DriverRegistry};
