//! Recipe documents.
//!
//! A recipe is an ordered list of phases. Each phase repeats an ordered list
//! of cycles, and each cycle holds one named environment for a fixed number
//! of hours. Documents are validated on load: a recipe that references an
//! undefined environment, or has an empty or zero-length schedule, is
//! rejected before anything runs.

use crate::error::{ConfigError, SchedulerError};
use crate::variable::VariableValue;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Tolerance when checking that a light spectrum sums to 100 percent.
const SPECTRUM_TOLERANCE_PERCENT: f64 = 1.0;

/// Free-form recipe description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Description {
    Text(String),
    Detailed {
        brief: String,
        #[serde(default)]
        verbose: String,
    },
}

/// A complete recipe document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub format: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub version: String,
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<Description>,
    #[serde(default)]
    pub parent_recipe_uuid: Option<Uuid>,
    #[serde(default)]
    pub support_recipe_uuids: Vec<Uuid>,
    #[serde(default)]
    pub creation_timestamp_utc: Option<String>,
    #[serde(default)]
    pub authors: Vec<Value>,
    #[serde(default)]
    pub cultivars: Vec<Value>,
    #[serde(default)]
    pub cultivation_methods: Vec<Value>,
    pub environments: BTreeMap<String, Environment>,
    pub phases: Vec<Phase>,
}

/// A repeatable block of cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    /// Number of times the cycle list runs. `0` runs it once, same as `1`.
    #[serde(default)]
    pub repeat: u32,
    pub cycles: Vec<Cycle>,
}

/// One timed reference to an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub name: String,
    pub environment: String,
    pub duration_hours: f64,
}

/// Named bundle of target values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_spectrum_nm_percent: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_ppfd_umol_m2_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_illumination_distance_cm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air_temperature_celsius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air_humidity_percent: Option<f64>,
    /// Any further setpoints the document carries, published as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Recipe {
    /// Parse and validate a recipe document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let recipe: Recipe = serde_json::from_str(json)?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Read, parse and validate a recipe file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check the phase/cycle structure and every environment reference.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.phases.is_empty() {
            return Err(SchedulerError::NoPhases);
        }

        for phase in &self.phases {
            if phase.cycles.is_empty() {
                return Err(SchedulerError::EmptyPhase {
                    phase: phase.name.clone(),
                });
            }

            for cycle in &phase.cycles {
                if !(cycle.duration_hours.is_finite() && cycle.duration_hours > 0.0) {
                    return Err(SchedulerError::NonPositiveDuration {
                        phase: phase.name.clone(),
                        cycle: cycle.name.clone(),
                        duration_hours: cycle.duration_hours,
                    });
                }

                if !self.environments.contains_key(&cycle.environment) {
                    return Err(SchedulerError::UnknownEnvironment {
                        phase: phase.name.clone(),
                        cycle: cycle.name.clone(),
                        environment: cycle.environment.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Non-fatal document problems worth logging.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (key, env) in &self.environments {
            if let Some(total) = env.spectrum_total() {
                let lit = env.light_ppfd_umol_m2_s.map(|ppfd| ppfd > 0.0).unwrap_or(true);
                if lit && (total - 100.0).abs() > SPECTRUM_TOLERANCE_PERCENT {
                    warnings.push(format!(
                        "environment '{}' spectrum sums to {:.2}%, expected 100%",
                        key, total
                    ));
                }
            }
        }
        warnings
    }

    pub fn environment(&self, key: &str) -> Option<&Environment> {
        self.environments.get(key)
    }
}

impl Phase {
    /// How many times the cycle list actually runs.
    pub fn effective_repeat(&self) -> u32 {
        self.repeat.max(1)
    }

    /// Hours covered by one pass over the cycle list.
    pub fn cycle_hours(&self) -> f64 {
        self.cycles.iter().map(|c| c.duration_hours).sum()
    }
}

impl Environment {
    /// Sum of the spectrum band percentages, if a spectrum is set.
    pub fn spectrum_total(&self) -> Option<f64> {
        self.light_spectrum_nm_percent
            .as_ref()
            .map(|bands| bands.values().sum())
    }

    /// Every setpoint in this environment, keyed by store variable name.
    pub fn variables(&self) -> Vec<(String, VariableValue)> {
        let mut vars = Vec::new();

        if let Some(bands) = &self.light_spectrum_nm_percent {
            vars.push((
                "light_spectrum_nm_percent".to_string(),
                VariableValue::Spectrum(bands.clone()),
            ));
        }

        let numeric = [
            ("light_ppfd_umol_m2_s", self.light_ppfd_umol_m2_s),
            ("light_illumination_distance_cm", self.light_illumination_distance_cm),
            ("air_temperature_celsius", self.air_temperature_celsius),
            ("air_humidity_percent", self.air_humidity_percent),
        ];
        for (name, value) in numeric {
            if let Some(v) = value {
                vars.push((name.to_string(), VariableValue::Number(v)));
            }
        }

        for (name, value) in &self.extra {
            if let Some(v) = VariableValue::from_json(value) {
                vars.push((name.clone(), v));
            }
        }

        vars
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}
