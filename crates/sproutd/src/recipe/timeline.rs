//! Quantised schedule of a recipe.
//!
//! Cycle durations are rounded to whole milliseconds once, at build time.
//! Every offset after that is integer arithmetic, so the incremental cursor
//! and the absolute position computed for a resume always agree.

use serde::Serialize;
use sprout_shared::{Recipe, SchedulerError};
use std::time::Duration;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Hours to whole milliseconds, never less than one. `None` if the result
/// does not fit in a `u64`.
pub fn quantize_hours(hours: f64) -> Option<u64> {
    let ms = (hours * MS_PER_HOUR).round();
    if !(ms < u64::MAX as f64) {
        return None;
    }
    Some((ms as u64).max(1))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSpan {
    pub name: String,
    pub environment: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSpan {
    pub name: String,
    /// Effective repeat count, at least one.
    pub repeat: u32,
    pub cycles: Vec<CycleSpan>,
    /// Offset of the phase from recipe start.
    pub start_ms: u64,
    /// One pass over the cycle list.
    pub pass_ms: u64,
}

// Timeline::build checks that every phase end fits in a u64.
impl PhaseSpan {
    pub fn span_ms(&self) -> u64 {
        self.pass_ms * self.repeat as u64
    }

    pub fn end_ms(&self) -> u64 {
        self.start_ms + self.span_ms()
    }
}

/// Where the schedule is at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub phase_idx: usize,
    pub repeat_idx: u32,
    pub cycle_idx: usize,
    /// Offset from recipe start at which the current cycle began.
    pub cycle_started_at: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Running(Cursor),
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    phases: Vec<PhaseSpan>,
    total_ms: u64,
}

impl Timeline {
    /// Validate and quantise a recipe.
    pub fn build(recipe: &Recipe) -> Result<Self, SchedulerError> {
        recipe.validate()?;

        let mut phases = Vec::with_capacity(recipe.phases.len());
        let mut offset = 0u64;
        for phase in &recipe.phases {
            let too_long = || SchedulerError::ScheduleTooLong {
                phase: phase.name.clone(),
            };

            let mut cycles = Vec::with_capacity(phase.cycles.len());
            let mut pass_ms = 0u64;
            for c in &phase.cycles {
                let duration_ms = quantize_hours(c.duration_hours).ok_or_else(too_long)?;
                pass_ms = pass_ms.checked_add(duration_ms).ok_or_else(too_long)?;
                cycles.push(CycleSpan {
                    name: c.name.clone(),
                    environment: c.environment.clone(),
                    duration_ms,
                });
            }

            let repeat = phase.effective_repeat();
            let end_ms = pass_ms
                .checked_mul(repeat as u64)
                .and_then(|span| offset.checked_add(span))
                .ok_or_else(too_long)?;
            phases.push(PhaseSpan {
                name: phase.name.clone(),
                repeat,
                cycles,
                start_ms: offset,
                pass_ms,
            });
            offset = end_ms;
        }

        Ok(Self {
            phases,
            total_ms: offset,
        })
    }

    pub fn phases(&self) -> &[PhaseSpan] {
        &self.phases
    }

    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }

    /// Shortest cycle in the recipe.
    pub fn min_cycle(&self) -> Duration {
        let ms = self
            .phases
            .iter()
            .flat_map(|p| p.cycles.iter().map(|c| c.duration_ms))
            .min()
            .unwrap_or(1);
        Duration::from_millis(ms)
    }

    /// The first cycle of the recipe.
    pub fn first(&self) -> Cursor {
        Cursor {
            phase_idx: 0,
            repeat_idx: 0,
            cycle_idx: 0,
            cycle_started_at: Duration::ZERO,
        }
    }

    pub fn cycle(&self, cursor: &Cursor) -> &CycleSpan {
        &self.phases[cursor.phase_idx].cycles[cursor.cycle_idx]
    }

    pub fn phase(&self, cursor: &Cursor) -> &PhaseSpan {
        &self.phases[cursor.phase_idx]
    }

    /// Offset from recipe start at which the cursor's cycle ends.
    pub fn cycle_end(&self, cursor: &Cursor) -> Duration {
        cursor.cycle_started_at + Duration::from_millis(self.cycle(cursor).duration_ms)
    }

    /// The cycle after `cursor`, or `None` at the end of the recipe.
    pub fn next(&self, cursor: &Cursor) -> Option<Cursor> {
        let phase = &self.phases[cursor.phase_idx];
        let cycle_started_at = self.cycle_end(cursor);

        if cursor.cycle_idx + 1 < phase.cycles.len() {
            return Some(Cursor {
                cycle_idx: cursor.cycle_idx + 1,
                cycle_started_at,
                ..*cursor
            });
        }
        if cursor.repeat_idx + 1 < phase.repeat {
            return Some(Cursor {
                repeat_idx: cursor.repeat_idx + 1,
                cycle_idx: 0,
                cycle_started_at,
                ..*cursor
            });
        }
        if cursor.phase_idx + 1 < self.phases.len() {
            return Some(Cursor {
                phase_idx: cursor.phase_idx + 1,
                repeat_idx: 0,
                cycle_idx: 0,
                cycle_started_at,
            });
        }
        None
    }

    /// Absolute position after `elapsed` since recipe start. Boundaries are
    /// half-open: at exactly the end of a cycle the next one is active.
    pub fn position_at(&self, elapsed: Duration) -> Position {
        let t = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if t >= self.total_ms {
            return Position::Completed;
        }

        let Some((phase_idx, phase)) = self
            .phases
            .iter()
            .enumerate()
            .find(|(_, p)| t < p.end_ms())
        else {
            return Position::Completed;
        };

        let into_phase = t - phase.start_ms;
        let repeat_idx = (into_phase / phase.pass_ms) as u32;
        let into_pass = into_phase % phase.pass_ms;

        let mut cycle_offset = 0u64;
        let mut cycle_idx = phase.cycles.len() - 1;
        for (idx, cycle) in phase.cycles.iter().enumerate() {
            if into_pass < cycle_offset + cycle.duration_ms {
                cycle_idx = idx;
                break;
            }
            cycle_offset += cycle.duration_ms;
        }

        let started = phase.start_ms + repeat_idx as u64 * phase.pass_ms + cycle_offset;
        Position::Running(Cursor {
            phase_idx,
            repeat_idx,
            cycle_idx,
            cycle_started_at: Duration::from_millis(started),
        })
    }
}
