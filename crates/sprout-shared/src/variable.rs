//! Values exchanged through the shared variable store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A single variable value.
///
/// Serialized untagged so store snapshots read like the documents they came
/// from (`22.5`, `true`, `{"400-499": 30.0, ...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Bool(bool),
    Number(f64),
    Text(String),
    /// Light spectrum: nm band label to percent.
    Spectrum(BTreeMap<String, f64>),
}

impl VariableValue {
    /// Convert a JSON value. Arrays, nulls and maps with non-numeric
    /// entries have no variable representation.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Object(map) => {
                let mut bands = BTreeMap::new();
                for (band, percent) in map {
                    bands.insert(band.clone(), percent.as_f64()?);
                }
                Some(Self::Spectrum(bands))
            }
            Value::Null | Value::Array(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Interpret as an on/off output. Numbers are on when positive.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Number(n) => Some(*n > 0.0),
            Self::Text(s) => match s.to_ascii_lowercase().as_str() {
                "on" | "true" | "high" => Some(true),
                "off" | "false" | "low" => Some(false),
                _ => None,
            },
            Self::Spectrum(_) => None,
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
            Self::Spectrum(bands) => {
                let parts: Vec<String> = bands
                    .iter()
                    .map(|(band, pct)| format!("{}:{}", band, pct))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
