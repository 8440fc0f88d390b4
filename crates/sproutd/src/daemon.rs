//! Daemon coordinator.
//!
//! Owns the store, the bus router, one manager task per peripheral and at
//! most one running recipe. Everything is validated before anything is
//! spawned: a bad recipe or setup leaves the store untouched.

use crate::bus::{BusRouter, I2cBackend};
use crate::config::Config;
use crate::peripherals::{
    DriverRegistry, ManagerSettings, PeripheralDriver, PeripheralHandle, PeripheralManager,
    PeripheralStatus,
};
use crate::recipe::{Clock, RecipeScheduler, RecipeStatus, SchedulerHandle, SchedulerTask};
use crate::store::{SharedVariable, VariableStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sprout_shared::{ConfigError, PeripheralSetup, Recipe, ValidationError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything `status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub version: String,
    pub recipe: Option<RecipeStatus>,
    pub peripherals: Vec<PeripheralStatus>,
    /// Names of peripherals whose fault breaker has tripped.
    pub faulted: Vec<String>,
    pub variables: Vec<SharedVariable>,
}

struct RunningPeripheral {
    handle: PeripheralHandle,
    task: JoinHandle<()>,
}

pub struct Daemon {
    config: Config,
    store: Arc<VariableStore>,
    router: Arc<BusRouter>,
    clock: Arc<dyn Clock>,
    peripherals: BTreeMap<String, RunningPeripheral>,
    scheduler: Option<SchedulerHandle>,
}

impl Daemon {
    pub fn new(config: Config, backend: Arc<dyn I2cBackend>, clock: Arc<dyn Clock>) -> Self {
        let router = Arc::new(BusRouter::new(backend, config.transaction_timeout()));
        Self {
            config,
            store: Arc::new(VariableStore::new()),
            router,
            clock,
            peripherals: BTreeMap::new(),
            scheduler: None,
        }
    }

    pub fn store(&self) -> &Arc<VariableStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<BusRouter> {
        &self.router
    }

    pub fn peripheral(&self, name: &str) -> Option<&PeripheralHandle> {
        self.peripherals.get(name).map(|p| &p.handle)
    }

    /// Validate the recipe and every setup, then spawn the managers and
    /// start the recipe. Nothing runs if any document is rejected.
    pub fn launch(
        &mut self,
        registry: &DriverRegistry,
        setups: Vec<PeripheralSetup>,
        recipe: Option<Recipe>,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), ConfigError> {
        let scheduler = match recipe {
            Some(recipe) => Some(self.prepare_recipe(recipe, started_at)?),
            None => None,
        };

        let mut names: HashSet<&str> = self.peripherals.keys().map(String::as_str).collect();
        for setup in &setups {
            setup.validate()?;
            if !names.insert(setup.name.as_str()) {
                return Err(ConfigError::DuplicatePeripheral(setup.name.clone()));
            }
        }

        let mut managers = Vec::with_capacity(setups.len());
        for setup in setups {
            let driver: Box<dyn PeripheralDriver> =
                registry.create(&setup, Arc::clone(&self.router))?;
            let settings = ManagerSettings::new(&self.config, &setup);
            managers.push(PeripheralManager::new(
                setup,
                driver,
                Arc::clone(&self.store),
                settings,
            )?);
        }

        for manager in managers {
            let (handle, task) = manager.spawn();
            info!(peripheral = %handle.name(), "peripheral started");
            self.peripherals
                .insert(handle.name().to_string(), RunningPeripheral { handle, task });
        }

        if let Some(scheduler) = scheduler {
            self.run_scheduler(scheduler);
        }
        Ok(())
    }

    /// Route an operator event to a peripheral.
    pub async fn send_event(
        &self,
        peripheral: &str,
        name: &str,
        value: Option<Value>,
    ) -> Result<(), ValidationError> {
        let running = self
            .peripherals
            .get(peripheral)
            .ok_or_else(|| ValidationError::UnknownPeripheral(peripheral.to_string()))?;
        running.handle.send_event(name, value).await
    }

    /// Replace the running recipe. The new recipe is validated before the
    /// old one is stopped.
    pub async fn start_recipe(
        &mut self,
        recipe: Recipe,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), ConfigError> {
        let scheduler = self.prepare_recipe(recipe, started_at)?;
        self.stop_recipe().await;
        self.run_scheduler(scheduler);
        Ok(())
    }

    /// Parse, validate and start a recipe document.
    pub async fn start_recipe_json(
        &mut self,
        json: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), ConfigError> {
        let recipe = Recipe::from_json(json)?;
        self.start_recipe(recipe, started_at).await
    }

    /// Stop the running recipe, leaving its last environment in the store.
    /// Returns false if no recipe was running.
    pub async fn stop_recipe(&mut self) -> bool {
        match self.scheduler.take() {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> RunStatus {
        let peripherals: Vec<PeripheralStatus> = self
            .peripherals
            .values()
            .map(|p| p.handle.status())
            .collect();
        let faulted = peripherals
            .iter()
            .filter(|s| s.faulted)
            .map(|s| s.name.clone())
            .collect();

        RunStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            recipe: self.scheduler.as_ref().map(SchedulerHandle::status),
            peripherals,
            faulted,
            variables: self.store.snapshot(),
        }
    }

    /// Stop the recipe and every manager. A manager that does not finish
    /// within its bound is aborted.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.stop_recipe().await;

        let bound = self.config.transaction_timeout() * 2;
        for (name, running) in std::mem::take(&mut self.peripherals) {
            let RunningPeripheral { handle, mut task } = running;
            match tokio::time::timeout(bound, handle.shutdown()).await {
                Ok(Ok(())) | Ok(Err(ValidationError::PeripheralUnavailable(_))) => {}
                Ok(Err(e)) => warn!(peripheral = %name, error = %e, "shutdown rejected"),
                Err(_) => warn!(peripheral = %name, "shutdown timed out"),
            }
            if tokio::time::timeout(bound, &mut task).await.is_err() {
                error!(peripheral = %name, "manager did not stop, aborting");
                task.abort();
            }
        }
        info!("shutdown complete");
    }

    fn prepare_recipe(
        &self,
        recipe: Recipe,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<RecipeScheduler, ConfigError> {
        for warning in recipe.warnings() {
            warn!(recipe = %recipe.name, "{}", warning);
        }

        let mut scheduler = RecipeScheduler::new(recipe)?;
        let now = self.clock.now();
        match started_at {
            Some(start) => scheduler.resume(start, now)?,
            None => scheduler.start(now)?,
        }
        Ok(scheduler)
    }

    fn run_scheduler(&mut self, scheduler: RecipeScheduler) {
        info!(
            recipe = %scheduler.recipe().name,
            total = ?scheduler.timeline().total(),
            "recipe started"
        );
        let task = SchedulerTask::new(
            scheduler,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.tick_interval(),
        );
        self.scheduler = Some(task.spawn());
    }
}
