//! Schedule-level behaviour: phase spans, restart consistency and a full
//! two-phase recipe driven through the scheduler task.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use sprout_shared::{ConfigError, Recipe, SchedulerError, VariableValue};
use sproutd::bus::SimulatedBus;
use sproutd::config::Config;
use sproutd::peripherals::DriverRegistry;
use sproutd::recipe::timeline::quantize_hours;
use sproutd::recipe::{
    ManualClock, Position, RecipeScheduler, SchedulerTask, StateKind, TickOutcome, Timeline,
};
use sproutd::store::VariableStore;
use sproutd::Daemon;
use std::sync::Arc;
use std::time::Duration;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T06:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn at(ms: u64) -> DateTime<Utc> {
    t0() + chrono::Duration::milliseconds(ms as i64)
}

fn random_recipe(rng: &mut StdRng) -> Recipe {
    let mut phases = Vec::new();
    for p in 0..rng.gen_range(1..=4) {
        let mut cycles = Vec::new();
        for c in 0..rng.gen_range(1..=4) {
            let environment = if rng.gen_bool(0.5) { "day" } else { "night" };
            cycles.push(json!({
                "name": format!("cycle-{}", c),
                "environment": environment,
                "duration_hours": rng.gen_range(0.0005..30.0),
            }));
        }
        phases.push(json!({
            "name": format!("phase-{}", p),
            "repeat": rng.gen_range(0..6),
            "cycles": cycles,
        }));
    }

    serde_json::from_value(json!({
        "uuid": "e4a5d0b8-6a7e-4f59-8d0c-2f1b7c3a9d40",
        "name": "Fuzz",
        "environments": {
            "day": {"name": "Day", "air_temperature_celsius": 24, "light_ppfd_umol_m2_s": 600},
            "night": {"name": "Night", "air_temperature_celsius": 18, "light_ppfd_umol_m2_s": 0}
        },
        "phases": phases,
    }))
    .unwrap()
}

#[test]
fn test_phase_spans_cover_repeat_times_cycle_sum() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..200 {
        let recipe = random_recipe(&mut rng);
        let timeline = Timeline::build(&recipe).unwrap();

        let mut expected_start = 0;
        for (span, phase) in timeline.phases().iter().zip(&recipe.phases) {
            let pass: u64 = phase
                .cycles
                .iter()
                .map(|c| quantize_hours(c.duration_hours).unwrap())
                .sum();
            assert_eq!(span.start_ms, expected_start);
            assert_eq!(span.span_ms(), pass * phase.repeat.max(1) as u64);
            expected_start = span.end_ms();
        }
        assert_eq!(timeline.total(), Duration::from_millis(expected_start));

        // Every instant inside a phase's span resolves to that phase, and
        // to a cycle whose half-open window contains it.
        for _ in 0..50 {
            let t = rng.gen_range(0..expected_start);
            let Position::Running(cursor) = timeline.position_at(Duration::from_millis(t)) else {
                panic!("position {}ms of {}ms reported complete", t, expected_start);
            };
            let phase = timeline.phase(&cursor);
            assert!(phase.start_ms <= t && t < phase.end_ms());
            assert!(cursor.cycle_started_at <= Duration::from_millis(t));
            assert!(Duration::from_millis(t) < timeline.cycle_end(&cursor));
        }

        assert_eq!(
            timeline.position_at(Duration::from_millis(expected_start)),
            Position::Completed
        );
    }
}

#[test]
fn test_restart_matches_continuous_run() {
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..100 {
        let recipe = random_recipe(&mut rng);
        let total = Timeline::build(&recipe).unwrap().total().as_millis() as u64;

        let mut continuous = RecipeScheduler::new(recipe.clone()).unwrap();
        continuous.start(t0()).unwrap();

        let mut now = 0;
        while now <= total + 1000 {
            now += rng.gen_range(1..=total / 10 + 2);
            let outcome = continuous.tick(at(now));

            let mut restarted = RecipeScheduler::new(recipe.clone()).unwrap();
            restarted.resume(t0(), at(now)).unwrap();

            match outcome {
                TickOutcome::Completed | TickOutcome::Finished => {
                    assert!(restarted.is_completed(), "restart at {}ms not complete", now);
                    break;
                }
                _ => {
                    let expected = continuous.current(at(now)).unwrap();
                    assert_eq!(restarted.current(at(now)), Some(expected.clone()));
                    assert_eq!(continuous.active(at(now)), Some(expected));
                }
            }
        }
    }
}

#[test]
fn test_boundary_belongs_to_next_cycle() {
    let recipe: Recipe = serde_json::from_value(json!({
        "uuid": "e4a5d0b8-6a7e-4f59-8d0c-2f1b7c3a9d41",
        "name": "Boundary",
        "environments": {"a": {"air_temperature_celsius": 1}, "b": {"air_temperature_celsius": 2}},
        "phases": [{"name": "P", "repeat": 2, "cycles": [
            {"name": "A", "environment": "a", "duration_hours": 1},
            {"name": "B", "environment": "b", "duration_hours": 1}
        ]}]
    }))
    .unwrap();

    let mut scheduler = RecipeScheduler::new(recipe).unwrap();
    scheduler.resume(t0(), at(3_600_000)).unwrap();
    let active = scheduler.current(at(3_600_000)).unwrap();
    assert_eq!(active.cycle, "B");
    assert_eq!(active.cursor.repeat_idx, 0);
    let active_cursor = active.cursor;

    assert_eq!(scheduler.tick(at(7_200_000)), {
        let mut expected = active_cursor;
        expected.repeat_idx = 1;
        expected.cycle_idx = 0;
        expected.cycle_started_at = Duration::from_millis(7_200_000);
        TickOutcome::Advanced(expected)
    });
    assert_eq!(scheduler.tick(at(14_400_000)), TickOutcome::Completed);
}

fn growth_recipe() -> Value {
    json!({
        "format": "openag-phased-environment-v1",
        "version": "1",
        "uuid": "3c4d5e6f-7a8b-4c9d-8e0f-1a2b3c4d5e6f",
        "name": "Frost Hardening",
        "environments": {
            "standard_day": {"name": "Standard Day", "air_temperature_celsius": 22, "light_ppfd_umol_m2_s": 800},
            "standard_night": {"name": "Standard Night", "air_temperature_celsius": 18, "light_ppfd_umol_m2_s": 0},
            "frosty_day": {"name": "Frosty Day", "air_temperature_celsius": 10, "light_ppfd_umol_m2_s": 800},
            "frosty_night": {"name": "Frosty Night", "air_temperature_celsius": 4, "light_ppfd_umol_m2_s": 0}
        },
        "phases": [
            {"name": "Standard Growth", "repeat": 30, "cycles": [
                {"name": "Day", "environment": "standard_day", "duration_hours": 0.0167},
                {"name": "Night", "environment": "standard_night", "duration_hours": 0.0167}
            ]},
            {"name": "Frosty Growth", "repeat": 0, "cycles": [
                {"name": "Day", "environment": "frosty_day", "duration_hours": 18},
                {"name": "Night", "environment": "frosty_night", "duration_hours": 6}
            ]}
        ]
    })
}

#[test]
fn test_standard_then_frosty_growth() {
    let recipe: Recipe = Recipe::from_json(&growth_recipe().to_string()).unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(VariableStore::new());

    let mut scheduler = RecipeScheduler::new(recipe).unwrap();
    scheduler.start(t0()).unwrap();
    let mut task = SchedulerTask::new(
        scheduler,
        store.clone(),
        clock.clone(),
        Duration::from_secs(2),
    );
    let status = task.subscribe();

    task.step();
    assert_eq!(
        store.desired("air_temperature_celsius").unwrap().value,
        VariableValue::Number(22.0)
    );

    // 30 passes of two 60.12s cycles, stepped every 30 seconds
    let standard_ms = 30 * 2 * quantize_hours(0.0167).unwrap();
    let mut stepped = 0;
    while stepped < standard_ms {
        clock.advance(Duration::from_secs(30));
        stepped += 30_000;
        task.step();
        let current = status.borrow().clone();
        if stepped < standard_ms {
            assert_eq!(current.phase.as_deref(), Some("Standard Growth"));
        }
    }

    let current = status.borrow().clone();
    assert_eq!(current.state, StateKind::Running);
    assert_eq!(current.phase.as_deref(), Some("Frosty Growth"));
    assert_eq!(current.cycle.as_deref(), Some("Day"));
    assert_eq!(current.repeat_total, Some(1));
    assert_eq!(
        store.desired("air_temperature_celsius").unwrap().value,
        VariableValue::Number(10.0)
    );
    assert_eq!(
        store.desired("light_ppfd_umol_m2_s").unwrap().value,
        VariableValue::Number(800.0)
    );

    // Frosty Growth runs once: day then night then done
    clock.advance(Duration::from_secs(18 * 3600));
    task.step();
    assert_eq!(status.borrow().cycle.as_deref(), Some("Night"));
    clock.advance(Duration::from_secs(6 * 3600));
    assert_eq!(task.step(), TickOutcome::Completed);
    assert_eq!(
        store.desired("air_temperature_celsius").unwrap().value,
        VariableValue::Number(4.0)
    );
}

#[tokio::test]
async fn test_undefined_environment_starts_nothing() {
    let mut doc = growth_recipe();
    doc["phases"][1]["cycles"][1]["environment"] = json!("arctic_night");
    // Bypass document validation so the daemon sees the bad reference
    let recipe: Recipe = serde_json::from_value(doc).unwrap();

    let setup = serde_json::from_value(json!({
        "name": "Air Sensor",
        "uuid": "0d9a3f7e-0b1c-4c55-a8cf-0f6f54f7aa01",
        "module_name": "device.peripherals.modules.sht40.manager",
        "class_name": "SHT40Manager",
        "parameters": {
            "variables": {"sensor": {"temperature_celsius": "air_temperature_celsius"}},
            "communication": {"bus": 2, "mux": "0x77", "channel": 1, "address": "0x44"}
        }
    }))
    .unwrap();

    let mut daemon = Daemon::new(
        Config::default(),
        Arc::new(SimulatedBus::new()),
        Arc::new(ManualClock::new(t0())),
    );
    let err = daemon
        .launch(&DriverRegistry::with_builtin(), vec![setup], Some(recipe), None)
        .unwrap_err();

    match err {
        ConfigError::Schedule(SchedulerError::UnknownEnvironment { environment, .. }) => {
            assert_eq!(environment, "arctic_night")
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(daemon.store().is_empty());
    assert!(daemon.peripheral("Air Sensor").is_none());
    assert!(daemon.status().recipe.is_none());
}
