//! Peripheral setup documents.

use crate::error::{ConfigError, ValidationError};
use crate::event::{
    valid_sampling_interval, EventDefinition, PeripheralEvent, SET_SAMPLING_INTERVAL,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use uuid::Uuid;

/// A peripheral setup document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralSetup {
    pub name: String,
    #[serde(default)]
    pub version: Value,
    pub uuid: Uuid,
    pub module_name: String,
    pub class_name: String,
    pub parameters: Parameters,
    #[serde(default)]
    pub events: Vec<EventDefinition>,
    #[serde(default)]
    pub info: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub communication: Communication,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variables {
    /// Driver reading name to store variable name.
    #[serde(default)]
    pub sensor: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub actuator: Option<ActuatorVariables>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActuatorVariables {
    #[serde(default)]
    pub output_variables: Vec<String>,
}

/// What a peripheral exchanges with the variable store.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralKind {
    /// Publishes readings: driver reading name to store variable name.
    Sensor(BTreeMap<String, String>),
    /// Realizes the listed store variables.
    Actuator(Vec<String>),
    /// Neither reads nor writes store variables.
    Passive,
}

/// Communication block: bus routing plus driver-specific fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Communication {
    #[serde(default)]
    pub bus: Value,
    #[serde(default)]
    pub mux: Value,
    #[serde(default)]
    pub channel: Value,
    #[serde(default)]
    pub address: Value,
    /// Driver fields such as `port` and `is_active_high`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Communication {
    pub fn bus(&self, peripheral: &str) -> Result<Option<u8>, ConfigError> {
        parse_u8_field(&self.bus, "bus", peripheral)
    }

    pub fn mux(&self, peripheral: &str) -> Result<Option<u8>, ConfigError> {
        parse_u8_field(&self.mux, "mux", peripheral)
    }

    pub fn channel(&self, peripheral: &str) -> Result<Option<u8>, ConfigError> {
        parse_u8_field(&self.channel, "channel", peripheral)
    }

    pub fn address(&self, peripheral: &str) -> Result<Option<u8>, ConfigError> {
        parse_u8_field(&self.address, "address", peripheral)
    }

    /// A driver-specific integer field.
    pub fn extra_u8(&self, field: &str, peripheral: &str) -> Result<Option<u8>, ConfigError> {
        match self.extra.get(field) {
            Some(value) => parse_u8_field(value, field, peripheral),
            None => Ok(None),
        }
    }

    /// A driver-specific boolean field.
    pub fn extra_bool(&self, field: &str) -> Option<bool> {
        self.extra.get(field).and_then(Value::as_bool)
    }
}

/// Parse an integer, a hex string (`"0x77"`), or `"none"`/null.
fn parse_u8_field(value: &Value, field: &str, peripheral: &str) -> Result<Option<u8>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidCommunication {
        peripheral: peripheral.to_string(),
        field: field.to_string(),
        reason,
    };

    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| invalid(format!("{} is not a byte", n))),
        Value::String(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("none") || s.is_empty() {
                return Ok(None);
            }
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u8::from_str_radix(hex, 16),
                None => s.parse::<u8>(),
            };
            parsed
                .map(Some)
                .map_err(|_| invalid(format!("'{}' is not a byte", s)))
        }
        other => Err(invalid(format!("unexpected value {}", other))),
    }
}

impl PeripheralSetup {
    /// Parse and validate a setup document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let setup: PeripheralSetup = serde_json::from_str(json)?;
        setup.validate()?;
        Ok(setup)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidSetup {
                peripheral: self.uuid.to_string(),
                reason: "name is empty".to_string(),
            });
        }

        self.kind()?;

        let comm = &self.parameters.communication;
        let bus = comm.bus(&self.name)?;
        let mux = comm.mux(&self.name)?;
        let channel = comm.channel(&self.name)?;
        comm.address(&self.name)?;

        if bus.is_some() && mux.is_some() != channel.is_some() {
            return Err(ConfigError::InvalidCommunication {
                peripheral: self.name.clone(),
                field: "channel".to_string(),
                reason: "mux and channel must be set together".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for event in &self.events {
            if !seen.insert(event.name.as_str()) {
                return Err(ConfigError::InvalidSetup {
                    peripheral: self.name.clone(),
                    reason: format!("event '{}' declared twice", event.name),
                });
            }
        }

        let declared = self
            .event(SET_SAMPLING_INTERVAL)
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.default.as_f64());
        if let Some(secs) = declared.filter(|secs| !valid_sampling_interval(*secs)) {
            return Err(ConfigError::InvalidSetup {
                peripheral: self.name.clone(),
                reason: format!("default sampling interval {}s is out of range", secs),
            });
        }

        Ok(())
    }

    pub fn kind(&self) -> Result<PeripheralKind, ConfigError> {
        let vars = &self.parameters.variables;
        match (&vars.sensor, &vars.actuator) {
            (Some(_), Some(_)) => Err(ConfigError::InvalidSetup {
                peripheral: self.name.clone(),
                reason: "declares both sensor and actuator variables".to_string(),
            }),
            (Some(sensor), None) => Ok(PeripheralKind::Sensor(sensor.clone())),
            (None, Some(actuator)) => Ok(PeripheralKind::Actuator(
                actuator.output_variables.clone(),
            )),
            (None, None) => Ok(PeripheralKind::Passive),
        }
    }

    pub fn event(&self, name: &str) -> Option<&EventDefinition> {
        self.events.iter().find(|e| e.name == name)
    }

    /// Look up a declared event by name and validate its value.
    pub fn resolve_event(
        &self,
        name: &str,
        value: Option<Value>,
    ) -> Result<PeripheralEvent, ValidationError> {
        let definition = self
            .event(name)
            .ok_or_else(|| ValidationError::UnsupportedEvent {
                peripheral: self.name.clone(),
                event: name.to_string(),
            })?;
        definition.resolve(&self.name, value)
    }

    /// Default sampling interval from the declared `Set Sampling Interval` event.
    pub fn default_sampling_interval_secs(&self) -> Option<f64> {
        self.event(SET_SAMPLING_INTERVAL)
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.default.as_f64())
            .filter(|secs| valid_sampling_interval(*secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn relay_setup() -> Value {
        json!({
            "name": "Heater Relay",
            "version": "1",
            "uuid": "2b5c3f1e-7f6e-4a49-9c6c-5d0e4d6fbc01",
            "module_name": "device.peripherals.modules.actuator_mcp23017.manager",
            "class_name": "ActuatorMCP23017Manager",
            "parameters": {
                "variables": {"sensor": null, "actuator": {"output_variables": ["port_state"]}},
                "communication": {
                    "bus": 2, "mux": "0x77", "channel": 1, "address": "0x20",
                    "port": 3, "is_active_high": true
                }
            },
            "events": [
                {"name": "Reset", "description": "Resets.", "value": null, "sequence": null},
                {"name": "Turn On", "is_manual": true}
            ]
        })
    }

    #[test]
    fn test_parse_actuator_setup() {
        let setup = PeripheralSetup::from_json(&relay_setup().to_string()).unwrap();
        let comm = &setup.parameters.communication;

        assert_eq!(
            setup.kind().unwrap(),
            PeripheralKind::Actuator(vec!["port_state".to_string()])
        );
        assert_eq!(comm.mux(&setup.name).unwrap(), Some(0x77));
        assert_eq!(comm.address(&setup.name).unwrap(), Some(0x20));
        assert_eq!(comm.extra_u8("port", &setup.name).unwrap(), Some(3));
        assert_eq!(comm.extra_bool("is_active_high"), Some(true));
    }

    #[test]
    fn test_none_bus_is_direct() {
        let mut doc = relay_setup();
        doc["parameters"]["communication"] = json!({
            "bus": "none",
            "mux": "none",
            "channel": "none",
            "address": "none"
        });
        let setup = PeripheralSetup::from_json(&doc.to_string()).unwrap();
        assert_eq!(setup.parameters.communication.bus(&setup.name).unwrap(), None);
    }

    #[test]
    fn test_bad_address_rejected() {
        let mut doc = relay_setup();
        doc["parameters"]["communication"]["address"] = json!("0xZZ");
        assert!(matches!(
            PeripheralSetup::from_json(&doc.to_string()),
            Err(ConfigError::InvalidCommunication { .. })
        ));
    }

    #[test]
    fn test_mux_without_channel_rejected() {
        let mut doc = relay_setup();
        doc["parameters"]["communication"]["channel"] = json!("none");
        assert!(PeripheralSetup::from_json(&doc.to_string()).is_err());
    }

    #[test]
    fn test_unknown_event_unsupported() {
        let setup = PeripheralSetup::from_json(&relay_setup().to_string()).unwrap();
        assert!(matches!(
            setup.resolve_event("Turn Sideways", None),
            Err(ValidationError::UnsupportedEvent { .. })
        ));
        assert_eq!(setup.resolve_event("Reset", None).unwrap(), PeripheralEvent::Reset);
    }

    #[test]
    fn test_passive_kind() {
        let mut doc = relay_setup();
        doc["parameters"]["variables"] = json!({"sensor": null, "actuator": null});
        let setup = PeripheralSetup::from_json(&doc.to_string()).unwrap();
        assert_eq!(setup.kind().unwrap(), PeripheralKind::Passive);
    }

    #[test]
    fn test_oversized_default_sampling_interval_rejected() {
        let mut doc = relay_setup();
        doc["events"] = json!([{"name": "Set Sampling Interval", "value": {"default": 1e300}}]);
        assert!(matches!(
            PeripheralSetup::from_json(&doc.to_string()),
            Err(ConfigError::InvalidSetup { .. })
        ));

        doc["events"] = json!([{"name": "Set Sampling Interval", "value": {"default": 30}}]);
        let setup = PeripheralSetup::from_json(&doc.to_string()).unwrap();
        assert_eq!(setup.default_sampling_interval_secs(), Some(30.0));
    }
}
