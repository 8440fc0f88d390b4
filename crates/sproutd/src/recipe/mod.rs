//! Recipe phase scheduler.
//!
//! A recipe is flattened into a [`Timeline`] of millisecond spans. The
//! [`RecipeScheduler`] walks it as a state machine driven by wall-clock
//! time, and the [`SchedulerTask`] ticks that machine on a tokio interval,
//! publishing the active environment into the store's `Desired` scope.

pub mod clock;
pub mod scheduler;
pub mod task;
pub mod timeline;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{
    ActiveEnvironment, RecipeScheduler, RecipeStatus, SchedulerState, StateKind, TickOutcome,
};
pub use task::{SchedulerHandle, SchedulerTask};
pub use timeline::{Cursor, Position, Timeline};
