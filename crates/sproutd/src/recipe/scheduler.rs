//! Recipe state machine: `NotStarted -> Running -> Completed`.

use super::timeline::{Cursor, Position, Timeline};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sprout_shared::{Environment, Recipe, SchedulerError};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    NotStarted,
    Running {
        started_at: DateTime<Utc>,
        cursor: Cursor,
    },
    Completed {
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    NotStarted,
    Running,
    Completed,
}

/// Result of one `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NotStarted,
    /// Still in the same cycle.
    Unchanged(Cursor),
    /// Crossed one or more boundaries.
    Advanced(Cursor),
    /// Crossed the end of the recipe on this tick.
    Completed,
    /// Was already complete.
    Finished,
}

/// The environment in force at some instant.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEnvironment<'a> {
    pub phase: &'a str,
    pub cycle: &'a str,
    pub environment_key: &'a str,
    pub environment: &'a Environment,
    pub cursor: Cursor,
    /// Time left in the current cycle.
    pub remaining: Duration,
}

/// Snapshot for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeStatus {
    pub recipe_name: String,
    pub recipe_uuid: Uuid,
    pub state: StateKind,
    pub started_at: Option<DateTime<Utc>>,
    pub phase: Option<String>,
    /// 1-based pass over the phase's cycle list.
    pub repeat: Option<u32>,
    pub repeat_total: Option<u32>,
    pub cycle: Option<String>,
    pub environment: Option<String>,
    pub cycle_remaining_secs: Option<f64>,
    pub percent_complete: f64,
    pub completed: bool,
}

pub struct RecipeScheduler {
    recipe: Arc<Recipe>,
    timeline: Timeline,
    state: SchedulerState,
}

impl RecipeScheduler {
    pub fn new(recipe: Recipe) -> Result<Self, SchedulerError> {
        let timeline = Timeline::build(&recipe)?;
        Ok(Self {
            recipe: Arc::new(recipe),
            timeline,
            state: SchedulerState::NotStarted,
        })
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, SchedulerState::Completed { .. })
    }

    /// Begin at the first cycle.
    pub fn start(&mut self, start_time: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.ensure_not_started()?;
        let cursor = self.timeline.first();
        self.log_cycle(&cursor);
        self.state = SchedulerState::Running {
            started_at: start_time,
            cursor,
        };
        Ok(())
    }

    /// Rebuild the cursor of a recipe that started at `start_time`.
    pub fn resume(
        &mut self,
        start_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.ensure_not_started()?;
        self.state = match self.timeline.position_at(elapsed(start_time, now)) {
            Position::Running(cursor) => {
                info!(
                    recipe = %self.recipe.name,
                    elapsed = ?elapsed(start_time, now),
                    "resuming recipe"
                );
                self.log_cycle(&cursor);
                SchedulerState::Running {
                    started_at: start_time,
                    cursor,
                }
            }
            Position::Completed => {
                info!(recipe = %self.recipe.name, "recipe already completed");
                SchedulerState::Completed {
                    started_at: start_time,
                }
            }
        };
        Ok(())
    }

    /// Advance the cursor across every boundary that has passed by `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let (started_at, mut cursor) = match self.state {
            SchedulerState::NotStarted => return TickOutcome::NotStarted,
            SchedulerState::Completed { .. } => return TickOutcome::Finished,
            SchedulerState::Running { started_at, cursor } => (started_at, cursor),
        };

        let elapsed = elapsed(started_at, now);
        let mut advanced = false;
        while elapsed >= self.timeline.cycle_end(&cursor) {
            match self.timeline.next(&cursor) {
                Some(next) => {
                    cursor = next;
                    advanced = true;
                    self.log_cycle(&cursor);
                }
                None => {
                    info!(recipe = %self.recipe.name, "recipe completed");
                    self.state = SchedulerState::Completed { started_at };
                    return TickOutcome::Completed;
                }
            }
        }

        self.state = SchedulerState::Running { started_at, cursor };
        if advanced {
            TickOutcome::Advanced(cursor)
        } else {
            TickOutcome::Unchanged(cursor)
        }
    }

    /// The environment in force at `now`, computed from the start time.
    pub fn active(&self, now: DateTime<Utc>) -> Option<ActiveEnvironment<'_>> {
        let started_at = match self.state {
            SchedulerState::Running { started_at, .. } => started_at,
            _ => return None,
        };

        let elapsed = elapsed(started_at, now);
        let Position::Running(cursor) = self.timeline.position_at(elapsed) else {
            return None;
        };
        Some(self.describe(cursor, elapsed))
    }

    /// The environment of the current cursor, as of the last tick.
    pub fn current(&self, now: DateTime<Utc>) -> Option<ActiveEnvironment<'_>> {
        match self.state {
            SchedulerState::Running { started_at, cursor } => {
                Some(self.describe(cursor, elapsed(started_at, now)))
            }
            _ => None,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> RecipeStatus {
        let total = self.timeline.total().as_secs_f64();
        let mut status = RecipeStatus {
            recipe_name: self.recipe.name.clone(),
            recipe_uuid: self.recipe.uuid,
            state: StateKind::NotStarted,
            started_at: None,
            phase: None,
            repeat: None,
            repeat_total: None,
            cycle: None,
            environment: None,
            cycle_remaining_secs: None,
            percent_complete: 0.0,
            completed: false,
        };

        match self.state {
            SchedulerState::NotStarted => {}
            SchedulerState::Completed { started_at } => {
                status.state = StateKind::Completed;
                status.started_at = Some(started_at);
                status.percent_complete = 100.0;
                status.completed = true;
            }
            SchedulerState::Running { started_at, cursor } => {
                let active = self.describe(cursor, elapsed(started_at, now));
                let phase = self.timeline.phase(&cursor);
                let done = elapsed(started_at, now).as_secs_f64();

                status.state = StateKind::Running;
                status.started_at = Some(started_at);
                status.phase = Some(active.phase.to_string());
                status.repeat = Some(cursor.repeat_idx + 1);
                status.repeat_total = Some(phase.repeat);
                status.cycle = Some(active.cycle.to_string());
                status.environment = Some(active.environment_key.to_string());
                status.cycle_remaining_secs = Some(active.remaining.as_secs_f64());
                status.percent_complete = if total > 0.0 {
                    (done / total * 100.0).min(100.0)
                } else {
                    100.0
                };
            }
        }
        status
    }

    fn describe(&self, cursor: Cursor, elapsed: Duration) -> ActiveEnvironment<'_> {
        let phase = self.timeline.phase(&cursor);
        let cycle = self.timeline.cycle(&cursor);
        // Timeline::build validated every reference
        let environment = self
            .recipe
            .environment(&cycle.environment)
            .unwrap_or_else(|| empty_environment());

        ActiveEnvironment {
            phase: &phase.name,
            cycle: &cycle.name,
            environment_key: &cycle.environment,
            environment,
            cursor,
            remaining: self.timeline.cycle_end(&cursor).saturating_sub(elapsed),
        }
    }

    fn ensure_not_started(&self) -> Result<(), SchedulerError> {
        match self.state {
            SchedulerState::NotStarted => Ok(()),
            _ => Err(SchedulerError::AlreadyStarted(self.recipe.name.clone())),
        }
    }

    fn log_cycle(&self, cursor: &Cursor) {
        let phase = self.timeline.phase(cursor);
        let cycle = self.timeline.cycle(cursor);
        info!(
            phase = %phase.name,
            repeat = cursor.repeat_idx + 1,
            of = phase.repeat,
            cycle = %cycle.name,
            environment = %cycle.environment,
            "cycle started"
        );
    }
}

fn empty_environment() -> &'static Environment {
    static EMPTY: std::sync::OnceLock<Environment> = std::sync::OnceLock::new();
    EMPTY.get_or_init(Environment::default)
}

/// Time since `start`; zero if `now` is earlier.
pub fn elapsed(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or(Duration::ZERO)
}
