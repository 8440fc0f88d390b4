//! Peripheral events: declared definitions and validated runtime commands.

use crate::error::ValidationError;
use crate::variable::VariableValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const RESET: &str = "Reset";
pub const SHUTDOWN: &str = "Shutdown";
pub const SET_SAMPLING_INTERVAL: &str = "Set Sampling Interval";
pub const ENABLE_MANUAL_MODE: &str = "Enable Manual Mode";
pub const DISABLE_MANUAL_MODE: &str = "Disable Manual Mode";

/// Sampling intervals are whole milliseconds, up to one day.
pub const MIN_SAMPLING_INTERVAL_SECS: f64 = 0.001;
pub const MAX_SAMPLING_INTERVAL_SECS: f64 = 86_400.0;

/// Whether `secs` is an acceptable sampling interval.
pub fn valid_sampling_interval(secs: f64) -> bool {
    (MIN_SAMPLING_INTERVAL_SECS..=MAX_SAMPLING_INTERVAL_SECS).contains(&secs)
}

/// Type of value an event accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[serde(alias = "float", alias = "int", alias = "integer")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "text")]
    String,
}

impl ValueKind {
    /// Kind of a JSON value, if it is a scalar.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Number(_) => Some(Self::Number),
            Value::Bool(_) => Some(Self::Boolean),
            Value::String(_) => Some(Self::String),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::String => "string",
        };
        write!(f, "{}", s)
    }
}

/// Typed value accepted by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventValueSpec {
    pub default: Value,
    #[serde(default)]
    pub unit: Option<String>,
    /// Explicit type; inferred from `default` when absent.
    #[serde(default, rename = "type")]
    pub kind: Option<ValueKind>,
}

impl EventValueSpec {
    pub fn value_kind(&self) -> Option<ValueKind> {
        self.kind.or_else(|| ValueKind::of(&self.default))
    }
}

/// An event declared in a peripheral setup document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub value: Option<EventValueSpec>,
    #[serde(default)]
    pub is_manual: bool,
    /// Reserved for composite events; every event runs as a single command.
    #[serde(default)]
    pub sequence: Option<Value>,
}

/// A validated command for a peripheral manager.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    Reset,
    Shutdown,
    SetSamplingInterval(f64),
    EnableManualMode,
    DisableManualMode,
    /// Operator actuation, only honored in manual mode.
    Manual {
        name: String,
        value: Option<VariableValue>,
    },
}

impl PeripheralEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Reset => RESET,
            Self::Shutdown => SHUTDOWN,
            Self::SetSamplingInterval(_) => SET_SAMPLING_INTERVAL,
            Self::EnableManualMode => ENABLE_MANUAL_MODE,
            Self::DisableManualMode => DISABLE_MANUAL_MODE,
            Self::Manual { name, .. } => name,
        }
    }
}

impl EventDefinition {
    /// Validate a requested value against this definition and build the
    /// runtime event. A missing value falls back to the declared default.
    pub fn resolve(
        &self,
        peripheral: &str,
        value: Option<Value>,
    ) -> Result<PeripheralEvent, ValidationError> {
        let value = self.check_value(value)?;

        if self.is_manual {
            return Ok(PeripheralEvent::Manual {
                name: self.name.clone(),
                value: value.as_ref().and_then(VariableValue::from_json),
            });
        }

        match self.name.as_str() {
            RESET => Ok(PeripheralEvent::Reset),
            SHUTDOWN => Ok(PeripheralEvent::Shutdown),
            ENABLE_MANUAL_MODE => Ok(PeripheralEvent::EnableManualMode),
            DISABLE_MANUAL_MODE => Ok(PeripheralEvent::DisableManualMode),
            SET_SAMPLING_INTERVAL => {
                let seconds = value.as_ref().and_then(Value::as_f64).ok_or_else(|| {
                    ValidationError::InvalidValue {
                        event: self.name.clone(),
                        expected: ValueKind::Number,
                        got: describe(value.as_ref()),
                    }
                })?;
                if !valid_sampling_interval(seconds) {
                    return Err(ValidationError::OutOfRange {
                        event: self.name.clone(),
                        reason: format!(
                            "sampling interval must be between {} and {} seconds, got {}",
                            MIN_SAMPLING_INTERVAL_SECS, MAX_SAMPLING_INTERVAL_SECS, seconds
                        ),
                    });
                }
                Ok(PeripheralEvent::SetSamplingInterval(seconds))
            }
            _ => Err(ValidationError::UnsupportedEvent {
                peripheral: peripheral.to_string(),
                event: self.name.clone(),
            }),
        }
    }

    fn check_value(&self, value: Option<Value>) -> Result<Option<Value>, ValidationError> {
        let Some(spec) = &self.value else {
            return Ok(value);
        };

        let value = value.unwrap_or_else(|| spec.default.clone());
        if let Some(expected) = spec.value_kind() {
            if ValueKind::of(&value) != Some(expected) {
                return Err(ValidationError::InvalidValue {
                    event: self.name.clone(),
                    expected,
                    got: describe(Some(&value)),
                });
            }
        }
        Ok(Some(value))
    }
}

fn describe(value: Option<&Value>) -> String {
    match value {
        None => "nothing".to_string(),
        Some(v) => v.to_string(),
    }
}
