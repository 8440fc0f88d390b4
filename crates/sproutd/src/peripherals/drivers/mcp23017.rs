//! MCP23017 GPIO expander driving one on/off port (relay, heater, fan).
//!
//! Only bank A is used. Writes are read-modify-write on the output latch so
//! peripherals sharing an expander keep each other's ports.

use super::bus_address;
use crate::bus::{BusAddress, BusHandle, BusRouter};
use crate::peripherals::driver::{Outputs, PeripheralDriver};
use async_trait::async_trait;
use sprout_shared::{ConfigError, DriverError, PeripheralKind, PeripheralSetup, VariableValue};
use std::sync::Arc;
use tracing::info;

const IODIRA: u8 = 0x00;
const GPIOA: u8 = 0x12;
const OLATA: u8 = 0x14;

pub const TURN_ON: &str = "Turn On";
pub const TURN_OFF: &str = "Turn Off";
pub const SET_OUTPUT: &str = "Set Output";

pub struct Mcp23017Driver {
    name: String,
    router: Arc<BusRouter>,
    address: BusAddress,
    port: u8,
    active_high: bool,
    outputs: Vec<String>,
}

impl Mcp23017Driver {
    pub fn new(
        name: impl Into<String>,
        router: Arc<BusRouter>,
        address: BusAddress,
        port: u8,
        active_high: bool,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            router,
            address,
            port,
            active_high,
            outputs,
        }
    }

    pub fn from_setup(
        setup: &PeripheralSetup,
        router: Arc<BusRouter>,
    ) -> Result<Box<dyn PeripheralDriver>, ConfigError> {
        let address = bus_address(setup)?;
        let comm = &setup.parameters.communication;
        let invalid = |reason: &str| ConfigError::InvalidSetup {
            peripheral: setup.name.clone(),
            reason: reason.to_string(),
        };

        let port = comm
            .extra_u8("port", &setup.name)?
            .ok_or_else(|| invalid("communication.port is required"))?;
        if port > 7 {
            return Err(invalid("communication.port must be 0-7"));
        }
        let active_high = comm.extra_bool("is_active_high").unwrap_or(true);

        let outputs = match setup.kind()? {
            PeripheralKind::Actuator(outputs) => outputs,
            _ => return Err(invalid("expects actuator output variables")),
        };

        Ok(Box::new(Self::new(
            &setup.name,
            router,
            address,
            port,
            active_high,
            outputs,
        )))
    }

    /// Switch the port on or off, honoring the configured polarity.
    async fn set_port(&self, on: bool) -> Result<(), DriverError> {
        let handle = self.router.acquire(&self.address).await?;
        let level = on == self.active_high;
        let latch = handle.read_register(OLATA).await?;
        let bit = 1u8 << self.port;
        let next = if level { latch | bit } else { latch & !bit };
        if next != latch {
            info!(peripheral = %self.name, port = self.port, on, "switching port");
        }
        handle.write_register(GPIOA, next).await?;
        Ok(())
    }

    async fn configure_output(&self, handle: &BusHandle) -> Result<(), DriverError> {
        let direction = handle.read_register(IODIRA).await?;
        handle.write_register(IODIRA, direction & !(1u8 << self.port)).await?;
        Ok(())
    }

    fn all_outputs(&self, on: bool) -> Outputs {
        self.outputs
            .iter()
            .map(|name| (name.clone(), VariableValue::Bool(on)))
            .collect()
    }
}

#[async_trait]
impl PeripheralDriver for Mcp23017Driver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self) -> Result<(), DriverError> {
        let handle = self.router.acquire(&self.address).await?;
        self.configure_output(&handle).await
    }

    async fn write(&mut self, outputs: &Outputs) -> Result<(), DriverError> {
        // The port follows the first declared output that is present
        let Some((variable, value)) = self
            .outputs
            .iter()
            .find_map(|name| outputs.get(name).map(|v| (name, v)))
        else {
            return Ok(());
        };

        let on = value.as_bool().ok_or_else(|| DriverError::InvalidOutput {
            variable: variable.clone(),
            reason: format!("'{}' is not an on/off value", value),
        })?;
        self.set_port(on).await
    }

    async fn manual_command(
        &mut self,
        name: &str,
        value: Option<&VariableValue>,
    ) -> Result<Outputs, DriverError> {
        let on = match name {
            TURN_ON => true,
            TURN_OFF => false,
            SET_OUTPUT => value.and_then(VariableValue::as_bool).ok_or_else(|| {
                DriverError::InvalidOutput {
                    variable: self.outputs.first().cloned().unwrap_or_default(),
                    reason: "expected an on/off value".to_string(),
                }
            })?,
            other => return Err(self.unsupported(other)),
        };
        self.set_port(on).await?;
        Ok(self.all_outputs(on))
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        self.set_port(false).await
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        self.set_port(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::simulator::{Mcp23017Sim, SimulatedBus, SimulatedDevice};
    use crate::peripherals::drivers::testing::setup;
    use serde_json::json;
    use std::time::Duration;

    const ADDR: BusAddress = BusAddress {
        bus: Some(2),
        mux: Some(0x77),
        channel: Some(1),
        address: Some(0x20),
    };

    fn rig(port: u8, active_high: bool) -> (Arc<SimulatedBus>, Mcp23017Driver) {
        let sim = Arc::new(SimulatedBus::new());
        sim.add_mux(2, 0x77);
        sim.add_device(ADDR, Mcp23017Sim::new());
        let router = Arc::new(BusRouter::new(sim.clone(), Duration::from_millis(100)));
        let driver = Mcp23017Driver::new(
            "heater",
            router,
            ADDR,
            port,
            active_high,
            vec!["heater_on".to_string()],
        );
        (sim, driver)
    }

    fn latch(sim: &SimulatedBus) -> u8 {
        sim.with_device::<Mcp23017Sim, _>(ADDR, |d| d.register(OLATA)).unwrap()
    }

    #[tokio::test]
    async fn test_setup_makes_port_an_output() {
        let (sim, mut driver) = rig(3, true);
        driver.setup().await.unwrap();
        let dir = sim.with_device::<Mcp23017Sim, _>(ADDR, |d| d.register(IODIRA)).unwrap();
        assert_eq!(dir, 0xFF & !(1 << 3));
    }

    #[tokio::test]
    async fn test_write_preserves_other_ports() {
        let (sim, mut driver) = rig(3, true);
        sim.with_device::<Mcp23017Sim, _>(ADDR, |d| {
            d.write(&[GPIOA, 0b0000_0001]).unwrap();
        });

        let mut outputs = Outputs::new();
        outputs.insert("heater_on".to_string(), VariableValue::Bool(true));
        driver.write(&outputs).await.unwrap();
        assert_eq!(latch(&sim), 0b0000_1001);

        outputs.insert("heater_on".to_string(), VariableValue::Number(0.0));
        driver.write(&outputs).await.unwrap();
        assert_eq!(latch(&sim), 0b0000_0001);
    }

    #[tokio::test]
    async fn test_active_low_inverts() {
        let (sim, mut driver) = rig(0, false);
        driver.manual_command(TURN_OFF, None).await.unwrap();
        assert_eq!(latch(&sim), 0b0000_0001);

        let outputs = driver.manual_command(TURN_ON, None).await.unwrap();
        assert_eq!(latch(&sim), 0);
        assert_eq!(outputs["heater_on"], VariableValue::Bool(true));
    }

    #[tokio::test]
    async fn test_non_boolean_output_rejected() {
        let (_sim, mut driver) = rig(0, true);
        let mut outputs = Outputs::new();
        outputs.insert("heater_on".to_string(), VariableValue::Text("warm".to_string()));
        assert!(matches!(
            driver.write(&outputs).await,
            Err(DriverError::InvalidOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_manual_command() {
        let (_sim, mut driver) = rig(0, true);
        assert!(matches!(
            driver.manual_command("Blink", None).await,
            Err(DriverError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_from_setup_requires_port() {
        let sim = Arc::new(SimulatedBus::new());
        let router = Arc::new(BusRouter::new(sim, Duration::from_millis(100)));
        let doc = setup(
            "heater",
            json!({"actuator": {"output_variables": ["heater_on"]}}),
            json!({"bus": 2, "mux": "0x77", "channel": 1, "address": "0x20"}),
        );
        assert!(Mcp23017Driver::from_setup(&doc, router.clone()).is_err());

        let doc = setup(
            "heater",
            json!({"actuator": {"output_variables": ["heater_on"]}}),
            json!({"bus": 2, "mux": "0x77", "channel": 1, "address": "0x20", "port": 4}),
        );
        assert!(Mcp23017Driver::from_setup(&doc, router).is_ok());
    }
}
