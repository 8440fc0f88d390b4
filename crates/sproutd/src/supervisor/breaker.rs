//! Fault breaker for peripheral supervision

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Fault breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultState {
    /// Last poll succeeded
    Healthy,
    /// Some consecutive polls failed, below the threshold
    Degraded,
    /// Threshold reached; stays faulted until reset
    Faulted,
}

/// Counts consecutive failed polls of one peripheral
#[derive(Debug, Clone)]
pub struct FaultBreaker {
    state: FaultState,
    /// Consecutive failed polls
    failure_count: u32,
    /// Failed polls before the breaker trips
    failure_threshold: u32,
    /// When the breaker tripped
    faulted_at: Option<DateTime<Utc>>,
}

impl FaultBreaker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            state: FaultState::Healthy,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            faulted_at: None,
        }
    }

    /// Record a failed poll. Returns true when this failure trips the breaker.
    pub fn record_failure(&mut self) -> bool {
        match self.state {
            FaultState::Healthy | FaultState::Degraded => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.trip();
                    true
                } else {
                    self.state = FaultState::Degraded;
                    false
                }
            }
            FaultState::Faulted => false,
        }
    }

    /// Record a successful poll
    pub fn record_success(&mut self) {
        match self.state {
            FaultState::Healthy | FaultState::Degraded => {
                self.failure_count = 0;
                self.state = FaultState::Healthy;
            }
            FaultState::Faulted => {
                // Only an explicit reset clears a fault
            }
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.state == FaultState::Faulted
    }

    pub fn state(&self) -> FaultState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn faulted_at(&self) -> Option<DateTime<Utc>> {
        self.faulted_at
    }

    /// Clear the fault and the failure count
    pub fn reset(&mut self) {
        self.state = FaultState::Healthy;
        self.failure_count = 0;
        self.faulted_at = None;
    }

    fn trip(&mut self) {
        self.state = FaultState::Faulted;
        self.faulted_at = Some(Utc::now());
    }
}

impl Default for FaultBreaker {
    fn default() -> Self {
        Self::new(3)
    }
}
