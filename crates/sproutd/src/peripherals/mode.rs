//! Peripheral manager modes and the transitions allowed between them.

use serde::Serialize;
use sprout_shared::ValidationError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Driver not set up yet
    Init,
    /// Polling and following the store
    Normal,
    /// Operator commands only; the store is not followed
    Manual,
    /// Faulted; only Reset or Shutdown leave this mode
    Error,
    /// Terminal
    Shutdown,
}

/// Allowed `(from, to)` pairs.
const TRANSITIONS: &[(Mode, Mode)] = &[
    (Mode::Init, Mode::Normal),
    (Mode::Init, Mode::Error),
    (Mode::Init, Mode::Shutdown),
    (Mode::Normal, Mode::Manual),
    (Mode::Normal, Mode::Error),
    (Mode::Normal, Mode::Shutdown),
    (Mode::Manual, Mode::Normal),
    (Mode::Manual, Mode::Error),
    (Mode::Manual, Mode::Shutdown),
    (Mode::Error, Mode::Normal),
    (Mode::Error, Mode::Shutdown),
];

impl Mode {
    pub fn can_transition(self, to: Mode) -> bool {
        TRANSITIONS.contains(&(self, to))
    }

    /// Validate a transition for `peripheral`.
    pub fn transition(self, to: Mode, peripheral: &str) -> Result<Mode, ValidationError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(ValidationError::InvalidTransition {
                peripheral: peripheral.to_string(),
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Whether the poll loop talks to the device in this mode.
    pub fn polls(self) -> bool {
        matches!(self, Mode::Normal | Mode::Manual)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Init => "init",
            Mode::Normal => "normal",
            Mode::Manual => "manual",
            Mode::Error => "error",
            Mode::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}
