//! Peripheral manager task.
//!
//! One task per peripheral owns its driver. Sensors publish readings into
//! the `Reported` scope; actuators realize their output variables from the
//! `Desired` scope, writing to the device only when a value changed. Driver
//! calls are retried with backoff; a poll that exhausts its retries marks
//! the peripheral's readings stale and counts against the fault breaker.
//! A tripped breaker parks the peripheral in `Error` until a `Reset` event.

use super::driver::{Outputs, PeripheralDriver, Readings};
use super::mode::Mode;
use crate::config::Config;
use crate::store::{Scope, VariableKey, VariableStore, WriterRole};
use crate::supervisor::{BackoffConfig, BackoffState, FaultBreaker, FaultState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sprout_shared::event::valid_sampling_interval;
use sprout_shared::{
    DriverError, PeripheralEvent, PeripheralKind, PeripheralSetup, ValidationError, VariableValue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

const COMMAND_QUEUE: usize = 16;

/// Used when neither the setup nor the config gives a usable interval.
const FALLBACK_SAMPLING_INTERVAL: Duration = Duration::from_secs(5);

fn sampling_period(secs: f64) -> Option<Duration> {
    if !valid_sampling_interval(secs) {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// Runtime knobs for one manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub sampling_interval: Duration,
    pub backoff: BackoffConfig,
    pub fault_threshold: u32,
    /// Upper bound on the driver shutdown call.
    pub shutdown_timeout: Duration,
}

impl ManagerSettings {
    /// Settings for a setup: its declared sampling interval wins over the
    /// configured default.
    pub fn new(config: &Config, setup: &PeripheralSetup) -> Self {
        let sampling_interval = setup
            .default_sampling_interval_secs()
            .and_then(sampling_period)
            .or_else(|| sampling_period(config.peripherals.default_sampling_interval_secs))
            .unwrap_or(FALLBACK_SAMPLING_INTERVAL);
        Self {
            sampling_interval,
            backoff: BackoffConfig::from(&config.peripherals),
            fault_threshold: config.peripherals.fault_threshold,
            shutdown_timeout: config.transaction_timeout(),
        }
    }
}

/// Published after every poll and command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeripheralStatus {
    pub name: String,
    pub mode: Mode,
    pub fault_state: FaultState,
    pub faulted: bool,
    pub consecutive_failures: u32,
    pub sampling_interval_secs: f64,
    pub last_error: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
    /// Outputs produced by the last successful manual command.
    pub last_commanded: Outputs,
}

enum ManagerCommand {
    Event {
        event: PeripheralEvent,
        reply: oneshot::Sender<Result<(), ValidationError>>,
    },
}

impl ManagerCommand {
    fn is_shutdown(&self) -> bool {
        matches!(
            self,
            ManagerCommand::Event {
                event: PeripheralEvent::Shutdown,
                ..
            }
        )
    }
}

/// Cloneable front end of a running manager.
#[derive(Clone)]
pub struct PeripheralHandle {
    setup: Arc<PeripheralSetup>,
    commands: mpsc::Sender<ManagerCommand>,
    status: watch::Receiver<PeripheralStatus>,
}

impl PeripheralHandle {
    pub fn name(&self) -> &str {
        &self.setup.name
    }

    pub fn setup(&self) -> &PeripheralSetup {
        &self.setup
    }

    /// Validate and deliver an event, waiting for the manager's verdict.
    ///
    /// Only events declared in the setup document are accepted, and values
    /// are checked against their declared type before anything is sent.
    pub async fn send_event(
        &self,
        name: &str,
        value: Option<Value>,
    ) -> Result<(), ValidationError> {
        let event = self.setup.resolve_event(name, value)?;
        self.deliver(event).await
    }

    /// Stop the manager whether or not its setup declares a `Shutdown` event.
    pub async fn shutdown(&self) -> Result<(), ValidationError> {
        self.deliver(PeripheralEvent::Shutdown).await
    }

    async fn deliver(&self, event: PeripheralEvent) -> Result<(), ValidationError> {
        let unavailable = || ValidationError::PeripheralUnavailable(self.setup.name.clone());

        let (reply, response) = oneshot::channel();
        self.commands
            .send(ManagerCommand::Event { event, reply })
            .await
            .map_err(|_| unavailable())?;
        response.await.map_err(|_| unavailable())?
    }

    pub fn status(&self) -> PeripheralStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PeripheralStatus> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

enum DriverCall<'a> {
    Setup,
    Read,
    Write(&'a Outputs),
}

pub struct PeripheralManager {
    setup: Arc<PeripheralSetup>,
    kind: PeripheralKind,
    driver: Box<dyn PeripheralDriver>,
    store: Arc<VariableStore>,
    settings: ManagerSettings,
    mode: Mode,
    breaker: FaultBreaker,
    /// Outputs the device is known to be in.
    realized: Outputs,
    last_commanded: Outputs,
    last_error: Option<String>,
    last_poll: Option<DateTime<Utc>>,
    status_tx: watch::Sender<PeripheralStatus>,
}

impl PeripheralManager {
    pub fn new(
        setup: PeripheralSetup,
        driver: Box<dyn PeripheralDriver>,
        store: Arc<VariableStore>,
        settings: ManagerSettings,
    ) -> Result<Self, sprout_shared::ConfigError> {
        let kind = setup.kind()?;
        let breaker = FaultBreaker::new(settings.fault_threshold);
        let initial = PeripheralStatus {
            name: setup.name.clone(),
            mode: Mode::Init,
            fault_state: breaker.state(),
            faulted: false,
            consecutive_failures: 0,
            sampling_interval_secs: settings.sampling_interval.as_secs_f64(),
            last_error: None,
            last_poll: None,
            last_commanded: Outputs::new(),
        };
        let (status_tx, _) = watch::channel(initial);

        Ok(Self {
            setup: Arc::new(setup),
            kind,
            driver,
            store,
            settings,
            mode: Mode::Init,
            breaker,
            realized: Outputs::new(),
            last_commanded: Outputs::new(),
            last_error: None,
            last_poll: None,
            status_tx,
        })
    }

    /// Start the manager task.
    pub fn spawn(self) -> (PeripheralHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = PeripheralHandle {
            setup: Arc::clone(&self.setup),
            commands,
            status: self.status_tx.subscribe(),
        };
        let span = info_span!("peripheral", name = %self.setup.name);
        let task = tokio::spawn(self.run(rx).instrument(span));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<ManagerCommand>) {
        info!(interval = ?self.settings.sampling_interval, "manager started");
        let mut ticker = self.ticker();

        loop {
            let command = tokio::select! {
                _ = ticker.tick() => match self.poll_until_shutdown(&mut commands).await {
                    Some(command) => command,
                    None => {
                        self.publish_status();
                        continue;
                    }
                },
                command = commands.recv() => command,
            };

            let Some(ManagerCommand::Event { event, reply }) = command else {
                // Every handle dropped
                self.stop().await;
                break;
            };
            let interval = self.settings.sampling_interval;
            let result = self.handle_event(event).await;
            if self.settings.sampling_interval != interval {
                ticker = self.ticker();
            }

            // Callers observe the new status as soon as they get a reply
            self.publish_status();
            let _ = reply.send(result);
            if self.mode == Mode::Shutdown {
                break;
            }
        }

        info!("manager stopped");
    }

    /// Poll once while watching the command queue. A shutdown, or every
    /// handle dropping, abandons the poll at its next await point so the
    /// bus is released within the in-flight transaction. Any other command
    /// waits for the poll to finish. Returns the command that arrived, if any.
    async fn poll_until_shutdown(
        &mut self,
        commands: &mut mpsc::Receiver<ManagerCommand>,
    ) -> Option<Option<ManagerCommand>> {
        let poll = self.poll();
        tokio::pin!(poll);

        tokio::select! {
            _ = &mut poll => None,
            command = commands.recv() => {
                match &command {
                    Some(c) if !c.is_shutdown() => poll.await,
                    _ => debug!("poll abandoned for shutdown"),
                }
                Some(command)
            }
        }
    }

    fn ticker(&self) -> time::Interval {
        let period = self.settings.sampling_interval;
        let mut ticker = match self.mode {
            Mode::Init => time::interval(period),
            _ => time::interval_at(Instant::now() + period, period),
        };
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn poll(&mut self) {
        if self.mode == Mode::Init && !self.bring_up().await {
            return;
        }
        if !self.mode.polls() {
            return;
        }

        let result = match self.kind.clone() {
            PeripheralKind::Sensor(map) => self.poll_sensor(&map).await,
            PeripheralKind::Actuator(outputs) if self.mode == Mode::Normal => {
                self.follow_store(&outputs).await
            }
            PeripheralKind::Actuator(_) | PeripheralKind::Passive => Ok(()),
        };
        self.last_poll = Some(Utc::now());

        match result {
            Ok(()) => {
                self.breaker.record_success();
                self.last_error = None;
            }
            Err(e) => self.record_failure(e),
        }
    }

    /// Set up the driver. Returns true once the peripheral is in `Normal`.
    async fn bring_up(&mut self) -> bool {
        match self.call(DriverCall::Setup).await {
            Ok(_) => {
                self.set_mode(Mode::Normal);
                true
            }
            Err(e) => {
                self.record_failure(e);
                false
            }
        }
    }

    async fn poll_sensor(
        &mut self,
        map: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), DriverError> {
        let readings = self.call(DriverCall::Read).await?.unwrap_or_default();

        let mut entries = Vec::with_capacity(map.len());
        for (reading, variable) in map {
            match readings.get(reading) {
                Some(value) => entries.push((variable.clone(), value.clone())),
                None => debug!(reading = %reading, "driver returned no value"),
            }
        }
        self.store.set_many(
            Scope::Reported,
            entries,
            WriterRole::Sensor(self.setup.name.clone()),
        );
        Ok(())
    }

    async fn follow_store(&mut self, outputs: &[String]) -> Result<(), DriverError> {
        let changed: Outputs = outputs
            .iter()
            .filter_map(|name| {
                self.store
                    .desired(name)
                    .map(|var| (name.clone(), var.value))
            })
            .filter(|(name, value)| self.realized.get(name) != Some(value))
            .collect();

        if changed.is_empty() {
            return Ok(());
        }

        debug!(outputs = ?changed, "applying desired outputs");
        self.call(DriverCall::Write(&changed)).await?;
        self.realized.extend(changed);
        Ok(())
    }

    /// Run one driver call, retrying transient failures with backoff.
    async fn call(&mut self, call: DriverCall<'_>) -> Result<Option<Readings>, DriverError> {
        let mut backoff = BackoffState::new(self.settings.backoff.clone());
        loop {
            let result = match &call {
                DriverCall::Setup => self.driver.setup().await.map(|_| None),
                DriverCall::Read => self.driver.read().await.map(Some),
                DriverCall::Write(outputs) => self.driver.write(outputs).await.map(|_| None),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match backoff.next_backoff() {
                    Some(delay) => {
                        debug!(attempt = backoff.attempts(), ?delay, error = %e, "retrying");
                        time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn record_failure(&mut self, e: DriverError) {
        warn!(error = %e, "poll failed");
        self.last_error = Some(e.to_string());

        if let PeripheralKind::Sensor(map) = &self.kind {
            for variable in map.values() {
                self.store.mark_stale(&VariableKey::reported(variable.as_str()));
            }
        }

        if self.breaker.record_failure() {
            error!(
                failures = self.breaker.failure_count(),
                "peripheral faulted"
            );
            self.set_mode(Mode::Error);
        }
    }

    async fn handle_event(&mut self, event: PeripheralEvent) -> Result<(), ValidationError> {
        info!(event = event.name(), mode = %self.mode, "event received");

        match event {
            PeripheralEvent::Reset => self.reset().await,
            PeripheralEvent::Shutdown => {
                self.stop().await;
                Ok(())
            }
            PeripheralEvent::SetSamplingInterval(secs) => {
                let interval =
                    sampling_period(secs).ok_or_else(|| ValidationError::OutOfRange {
                        event: sprout_shared::event::SET_SAMPLING_INTERVAL.to_string(),
                        reason: format!("sampling interval {}s is out of range", secs),
                    })?;
                self.settings.sampling_interval = interval;
                info!(interval_secs = secs, "sampling interval changed");
                Ok(())
            }
            PeripheralEvent::EnableManualMode => self.enter(Mode::Manual),
            PeripheralEvent::DisableManualMode => {
                self.enter(Mode::Normal)?;
                // Re-apply the store on the next poll
                self.realized.clear();
                Ok(())
            }
            PeripheralEvent::Manual { name, value } => self.manual(&name, value).await,
        }
    }

    async fn reset(&mut self) -> Result<(), ValidationError> {
        if self.mode == Mode::Shutdown {
            return Err(self.invalid_transition(Mode::Normal));
        }

        let result = match self.driver.reset().await {
            Ok(()) => self.call(DriverCall::Setup).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.last_error = Some(e.to_string());
            return Err(ValidationError::CommandFailed {
                peripheral: self.setup.name.clone(),
                event: sprout_shared::event::RESET.to_string(),
                reason: e.to_string(),
            });
        }

        self.breaker.reset();
        self.last_error = None;
        self.realized.clear();
        if matches!(self.mode, Mode::Init | Mode::Error) {
            self.set_mode(Mode::Normal);
        }
        Ok(())
    }

    async fn manual(
        &mut self,
        name: &str,
        value: Option<VariableValue>,
    ) -> Result<(), ValidationError> {
        if self.mode != Mode::Manual {
            return Err(ValidationError::ManualModeRequired {
                peripheral: self.setup.name.clone(),
                event: name.to_string(),
            });
        }

        let outputs = self
            .driver
            .manual_command(name, value.as_ref())
            .await
            .map_err(|e| ValidationError::CommandFailed {
                peripheral: self.setup.name.clone(),
                event: name.to_string(),
                reason: e.to_string(),
            })?;

        if !outputs.is_empty() {
            self.store.set_many(
                Scope::Desired,
                outputs.clone(),
                WriterRole::Manual(self.setup.name.clone()),
            );
        }
        self.realized.extend(outputs.clone());
        self.last_commanded = outputs;
        Ok(())
    }

    /// Move to `to` on request. Already being there is not an error.
    fn enter(&mut self, to: Mode) -> Result<(), ValidationError> {
        if self.mode == to {
            return Ok(());
        }
        self.mode.transition(to, &self.setup.name)?;
        self.set_mode(to);
        Ok(())
    }

    fn set_mode(&mut self, to: Mode) {
        if self.mode.can_transition(to) {
            info!(from = %self.mode, to = %to, "mode change");
            self.mode = to;
        } else {
            warn!(from = %self.mode, to = %to, "ignoring invalid mode change");
        }
    }

    async fn stop(&mut self) {
        if self.mode == Mode::Shutdown {
            return;
        }
        match time::timeout(self.settings.shutdown_timeout, self.driver.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "driver shutdown failed"),
            Err(_) => warn!("driver shutdown timed out"),
        }
        self.set_mode(Mode::Shutdown);
    }

    fn invalid_transition(&self, to: Mode) -> ValidationError {
        ValidationError::InvalidTransition {
            peripheral: self.setup.name.clone(),
            from: self.mode.to_string(),
            to: to.to_string(),
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(PeripheralStatus {
            name: self.setup.name.clone(),
            mode: self.mode,
            fault_state: self.breaker.state(),
            faulted: self.breaker.is_faulted(),
            consecutive_failures: self.breaker.failure_count(),
            sampling_interval_secs: self.settings.sampling_interval.as_secs_f64(),
            last_error: self.last_error.clone(),
            last_poll: self.last_poll,
            last_commanded: self.last_commanded.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use sprout_shared::BusError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        reading: f64,
        fail_reads: bool,
        fail_setup: bool,
        reads: u32,
        writes: Vec<Outputs>,
        resets: u32,
        shutdowns: u32,
        read_delay: Duration,
    }

    struct FakeDriver {
        script: Arc<Mutex<Script>>,
    }

    fn io_error() -> DriverError {
        DriverError::Bus(BusError::Io("scripted failure".to_string()))
    }

    #[async_trait]
    impl PeripheralDriver for FakeDriver {
        fn name(&self) -> &str {
            "fake"
        }

        async fn setup(&mut self) -> Result<(), DriverError> {
            if self.script.lock().unwrap().fail_setup {
                return Err(io_error());
            }
            Ok(())
        }

        async fn read(&mut self) -> Result<Readings, DriverError> {
            let delay = {
                let mut script = self.script.lock().unwrap();
                script.reads += 1;
                script.read_delay
            };
            if !delay.is_zero() {
                time::sleep(delay).await;
            }

            let script = self.script.lock().unwrap();
            if script.fail_reads {
                return Err(io_error());
            }
            let mut readings = Readings::new();
            readings.insert("temperature_celsius".to_string(), script.reading.into());
            Ok(readings)
        }

        async fn write(&mut self, outputs: &Outputs) -> Result<(), DriverError> {
            self.script.lock().unwrap().writes.push(outputs.clone());
            Ok(())
        }

        async fn manual_command(
            &mut self,
            name: &str,
            _value: Option<&VariableValue>,
        ) -> Result<Outputs, DriverError> {
            let on = name == "Turn On";
            let mut outputs = Outputs::new();
            outputs.insert("heater_on".to_string(), on.into());
            Ok(outputs)
        }

        async fn reset(&mut self) -> Result<(), DriverError> {
            self.script.lock().unwrap().resets += 1;
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), DriverError> {
            self.script.lock().unwrap().shutdowns += 1;
            Ok(())
        }
    }

    const EVENTS: &str = r#"[
        {"name": "Reset"},
        {"name": "Shutdown"},
        {"name": "Set Sampling Interval", "value": {"default": 1, "unit": "Seconds"}},
        {"name": "Enable Manual Mode"},
        {"name": "Disable Manual Mode"},
        {"name": "Turn On", "is_manual": true},
        {"name": "Turn Off", "is_manual": true}
    ]"#;

    fn sensor_setup() -> PeripheralSetup {
        serde_json::from_value(json!({
            "name": "Air Sensor",
            "uuid": "0d9a3f7e-0b1c-4c55-a8cf-0f6f54f7aa01",
            "module_name": "test", "class_name": "Fake",
            "parameters": {
                "variables": {"sensor": {"temperature_celsius": "air_temperature_celsius"}},
                "communication": {"bus": 2, "mux": "0x77", "channel": 1, "address": "0x44"}
            },
            "events": serde_json::from_str::<Value>(EVENTS).unwrap()
        }))
        .unwrap()
    }

    fn actuator_setup() -> PeripheralSetup {
        serde_json::from_value(json!({
            "name": "Heater",
            "uuid": "0d9a3f7e-0b1c-4c55-a8cf-0f6f54f7aa02",
            "module_name": "test", "class_name": "Fake",
            "parameters": {
                "variables": {"actuator": {"output_variables": ["heater_on"]}},
                "communication": {"bus": 2, "mux": "0x77", "channel": 1, "address": "0x20", "port": 0}
            },
            "events": serde_json::from_str::<Value>(EVENTS).unwrap()
        }))
        .unwrap()
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            sampling_interval: Duration::from_secs(1),
            backoff: BackoffConfig {
                base_ms: 10,
                factor: 2.0,
                jitter_percent: 0.0,
                max_ms: 100,
                max_attempts: 3,
            },
            fault_threshold: 3,
            shutdown_timeout: Duration::from_millis(500),
        }
    }

    fn start(
        setup: PeripheralSetup,
        store: &Arc<VariableStore>,
    ) -> (Arc<Mutex<Script>>, PeripheralHandle, JoinHandle<()>) {
        let script = Arc::new(Mutex::new(Script {
            reading: 21.0,
            ..Script::default()
        }));
        let driver = Box::new(FakeDriver { script: script.clone() });
        let manager = PeripheralManager::new(setup, driver, store.clone(), settings()).unwrap();
        let (handle, task) = manager.spawn();
        (script, handle, task)
    }

    async fn settle() {
        time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_publishes_reported() {
        let store = Arc::new(VariableStore::new());
        let (_script, handle, _task) = start(sensor_setup(), &store);
        settle().await;

        let var = store.reported("air_temperature_celsius").unwrap();
        assert_eq!(var.value, VariableValue::Number(21.0));
        assert_eq!(var.writer, WriterRole::Sensor("Air Sensor".to_string()));
        assert!(store.desired("air_temperature_celsius").is_none());
        assert_eq!(handle.status().mode, Mode::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_mark_stale_then_fault() {
        let store = Arc::new(VariableStore::new());
        let (script, handle, _task) = start(sensor_setup(), &store);
        settle().await;

        script.lock().unwrap().fail_reads = true;
        time::sleep(Duration::from_secs(1)).await;

        let var = store.reported("air_temperature_celsius").unwrap();
        assert!(!var.is_fresh());
        assert_eq!(var.value, VariableValue::Number(21.0));
        assert_eq!(script.lock().unwrap().reads, 1 + 3);
        assert_eq!(handle.status().fault_state, FaultState::Degraded);

        time::sleep(Duration::from_secs(2)).await;
        let status = handle.status();
        assert!(status.faulted);
        assert_eq!(status.mode, Mode::Error);
        assert!(status.last_error.is_some());

        // Faulted peripherals stop polling
        let reads = script.lock().unwrap().reads;
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(script.lock().unwrap().reads, reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_recovers_from_error() {
        let store = Arc::new(VariableStore::new());
        let (script, handle, _task) = start(sensor_setup(), &store);
        script.lock().unwrap().fail_reads = true;
        time::sleep(Duration::from_millis(4100)).await;
        assert_eq!(handle.status().mode, Mode::Error);

        script.lock().unwrap().fail_reads = false;
        handle.send_event("Reset", None).await.unwrap();
        let status = handle.status();
        assert_eq!(status.mode, Mode::Normal);
        assert!(!status.faulted);
        assert_eq!(script.lock().unwrap().resets, 1);

        time::sleep(Duration::from_secs(1)).await;
        assert!(store.reported("air_temperature_celsius").unwrap().is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_counts_toward_fault() {
        let store = Arc::new(VariableStore::new());
        let script = Arc::new(Mutex::new(Script {
            fail_setup: true,
            ..Script::default()
        }));
        let driver = Box::new(FakeDriver { script });
        let manager =
            PeripheralManager::new(sensor_setup(), driver, store.clone(), settings()).unwrap();
        let (handle, _task) = manager.spawn();

        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(handle.status().mode, Mode::Error);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_actuator_writes_only_changes() {
        let store = Arc::new(VariableStore::new());
        store.set(VariableKey::desired("heater_on"), true.into(), WriterRole::Scheduler);
        let (script, _handle, _task) = start(actuator_setup(), &store);

        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(script.lock().unwrap().writes.len(), 1);

        store.set(VariableKey::desired("heater_on"), false.into(), WriterRole::Scheduler);
        time::sleep(Duration::from_secs(1)).await;

        let writes = script.lock().unwrap().writes.clone();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1]["heater_on"], VariableValue::Bool(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_event_requires_manual_mode() {
        let store = Arc::new(VariableStore::new());
        let (_script, handle, _task) = start(actuator_setup(), &store);
        settle().await;

        let err = handle.send_event("Turn On", None).await.unwrap_err();
        assert!(matches!(err, ValidationError::ManualModeRequired { .. }));
        assert!(handle.status().last_commanded.is_empty());
        assert!(store.desired("heater_on").is_none());

        handle.send_event("Enable Manual Mode", None).await.unwrap();
        handle.send_event("Turn On", None).await.unwrap();

        let status = handle.status();
        assert_eq!(status.mode, Mode::Manual);
        assert_eq!(status.last_commanded["heater_on"], VariableValue::Bool(true));
        let var = store.desired("heater_on").unwrap();
        assert_eq!(var.writer, WriterRole::Manual("Heater".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_ignores_store() {
        let store = Arc::new(VariableStore::new());
        let (script, handle, _task) = start(actuator_setup(), &store);
        settle().await;
        handle.send_event("Enable Manual Mode", None).await.unwrap();

        store.set(VariableKey::desired("heater_on"), true.into(), WriterRole::Scheduler);
        time::sleep(Duration::from_secs(3)).await;
        assert!(script.lock().unwrap().writes.is_empty());

        handle.send_event("Disable Manual Mode", None).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(script.lock().unwrap().writes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeclared_event_rejected() {
        let store = Arc::new(VariableStore::new());
        let (_script, handle, _task) = start(sensor_setup(), &store);

        assert!(matches!(
            handle.send_event("Self Destruct", None).await,
            Err(ValidationError::UnsupportedEvent { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_interval_change() {
        let store = Arc::new(VariableStore::new());
        let (script, handle, _task) = start(sensor_setup(), &store);
        settle().await;

        assert!(matches!(
            handle.send_event("Set Sampling Interval", Some(json!(-2))).await,
            Err(ValidationError::OutOfRange { .. })
        ));

        handle
            .send_event("Set Sampling Interval", Some(json!(10)))
            .await
            .unwrap();
        assert_eq!(handle.status().sampling_interval_secs, 10.0);

        let reads = script.lock().unwrap().reads;
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(script.lock().unwrap().reads, reads);
        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(script.lock().unwrap().reads, reads + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_sampling_interval_rejected() {
        let store = Arc::new(VariableStore::new());
        let (script, handle, _task) = start(sensor_setup(), &store);
        settle().await;

        assert!(matches!(
            handle.send_event("Set Sampling Interval", Some(json!(1e300))).await,
            Err(ValidationError::OutOfRange { .. })
        ));
        // Values that skip event validation are still refused by the task
        for secs in [1e300, f64::INFINITY, f64::NAN, 1e-12] {
            assert!(matches!(
                handle.deliver(PeripheralEvent::SetSamplingInterval(secs)).await,
                Err(ValidationError::OutOfRange { .. })
            ));
        }

        assert!(handle.is_running());
        assert_eq!(handle.status().sampling_interval_secs, 1.0);
        handle.send_event("Reset", None).await.unwrap();

        let reads = script.lock().unwrap().reads;
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(script.lock().unwrap().reads, reads + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retrying_poll() {
        let store = Arc::new(VariableStore::new());
        let (script, handle, task) = start(sensor_setup(), &store);
        {
            let mut script = script.lock().unwrap();
            script.fail_reads = true;
            script.read_delay = Duration::from_millis(500);
        }
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(script.lock().unwrap().reads, 1);

        let sent = Instant::now();
        handle.send_event("Shutdown", None).await.unwrap();
        task.await.unwrap();

        assert!(
            sent.elapsed() < Duration::from_millis(500),
            "shutdown took {:?}",
            sent.elapsed()
        );
        assert_eq!(handle.status().mode, Mode::Shutdown);
        let script = script.lock().unwrap();
        assert_eq!(script.reads, 1);
        assert_eq!(script.shutdowns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_during_poll_waits_for_poll() {
        let store = Arc::new(VariableStore::new());
        let (script, handle, _task) = start(sensor_setup(), &store);
        script.lock().unwrap().read_delay = Duration::from_millis(300);
        time::sleep(Duration::from_millis(50)).await;

        handle
            .send_event("Set Sampling Interval", Some(json!(2)))
            .await
            .unwrap();
        assert!(store.reported("air_temperature_celsius").is_some());
        assert_eq!(handle.status().sampling_interval_secs, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_task() {
        let store = Arc::new(VariableStore::new());
        let (script, handle, task) = start(sensor_setup(), &store);
        settle().await;

        handle.send_event("Shutdown", None).await.unwrap();
        task.await.unwrap();

        assert_eq!(script.lock().unwrap().shutdowns, 1);
        assert_eq!(handle.status().mode, Mode::Shutdown);
        assert!(matches!(
            handle.send_event("Reset", None).await,
            Err(ValidationError::PeripheralUnavailable(_))
        ));
    }

    #[test]
    fn test_settings_prefer_declared_interval() {
        let config = Config::default();
        let settings = ManagerSettings::new(&config, &sensor_setup());
        assert_eq!(settings.sampling_interval, Duration::from_secs(1));

        let mut setup = sensor_setup();
        setup.events.clear();
        let settings = ManagerSettings::new(&config, &setup);
        assert_eq!(settings.sampling_interval, Duration::from_secs(5));

        let mut config = Config::default();
        config.peripherals.default_sampling_interval_secs = 1e300;
        let settings = ManagerSettings::new(&config, &setup);
        assert_eq!(settings.sampling_interval, FALLBACK_SAMPLING_INTERVAL);
    }
}
