//! Scheduler task: ticks the recipe and publishes the active environment.

use super::clock::Clock;
use super::scheduler::{RecipeScheduler, RecipeStatus, TickOutcome};
use crate::store::{Scope, VariableStore, WriterRole};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

const MIN_TICK: Duration = Duration::from_millis(1);

pub struct SchedulerTask {
    scheduler: RecipeScheduler,
    store: Arc<VariableStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    status_tx: watch::Sender<RecipeStatus>,
}

impl SchedulerTask {
    /// Wrap a started (or resumed) scheduler. The tick interval is clamped
    /// so no cycle can pass between two ticks.
    pub fn new(
        scheduler: RecipeScheduler,
        store: Arc<VariableStore>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        let shortest = scheduler.timeline().min_cycle();
        let interval = if tick_interval > shortest {
            warn!(
                requested = ?tick_interval,
                clamped = ?shortest,
                "tick interval longer than shortest cycle, clamping"
            );
            shortest
        } else {
            tick_interval
        }
        .max(MIN_TICK);

        let (status_tx, _) = watch::channel(scheduler.status(clock.now()));
        Self {
            scheduler,
            store,
            clock,
            interval,
            status_tx,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn scheduler(&self) -> &RecipeScheduler {
        &self.scheduler
    }

    pub fn subscribe(&self) -> watch::Receiver<RecipeStatus> {
        self.status_tx.subscribe()
    }

    /// Tick once at the clock's current time and publish the active
    /// environment if the recipe is still running.
    pub fn step(&mut self) -> TickOutcome {
        let now = self.clock.now();
        let outcome = self.scheduler.tick(now);

        if let TickOutcome::Unchanged(_) | TickOutcome::Advanced(_) = outcome {
            if let Some(active) = self.scheduler.current(now) {
                let variables = active.environment.variables();
                let written = self
                    .store
                    .set_many(Scope::Desired, variables, WriterRole::Scheduler);
                debug!(
                    environment = active.environment_key,
                    variables = written,
                    "published environment"
                );
            }
        }

        self.status_tx.send_replace(self.scheduler.status(now));
        outcome
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let status = self.status_tx.subscribe();
        let span = info_span!("scheduler", recipe = %self.scheduler.recipe().name);
        let task = tokio::spawn(self.run(stop_rx).instrument(span));
        SchedulerHandle {
            status,
            stop: Some(stop_tx),
            task,
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        info!(interval = ?self.interval, "scheduler started");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("scheduler stopped, last environment left in place");
                    break;
                }
                _ = ticker.tick() => match self.step() {
                    TickOutcome::Completed | TickOutcome::Finished => break,
                    TickOutcome::NotStarted => {
                        warn!("recipe was never started");
                        break;
                    }
                    TickOutcome::Unchanged(_) | TickOutcome::Advanced(_) => {}
                },
            }
        }
    }
}

/// Owner side of a running scheduler task.
pub struct SchedulerHandle {
    status: watch::Receiver<RecipeStatus>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn status(&self) -> RecipeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecipeStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop ticking. Published values stay in the store.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}
