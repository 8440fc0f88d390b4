//! Sprout Daemon - grow recipe scheduler and peripheral manager

mod cli;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use cli::{Cli, Commands};
use sprout_shared::{PeripheralSetup, Recipe};
use sproutd::bus::simulator::{Bh1750Sim, Mcp23017Sim, Sht40Sim};
use sproutd::bus::{BusAddress, SimulatedBus};
use sproutd::config::Config;
use sproutd::peripherals::registry::{BH1750_CLASS, MCP23017_CLASS, SHT40_CLASS};
use sproutd::peripherals::DriverRegistry;
use sproutd::recipe::{RecipeScheduler, SystemClock};
use sproutd::{control, Daemon};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            recipe,
            setups,
            config,
            started_at,
        } => run(recipe, setups, config, started_at).await,
        Commands::CheckRecipe { file } => check_recipe(file),
        Commands::Schedule { file, elapsed } => schedule(file, elapsed),
    }
}

async fn run(
    recipe: Option<PathBuf>,
    setups: Vec<PathBuf>,
    config: Option<PathBuf>,
    started_at: Option<DateTime<Utc>>,
) -> Result<()> {
    info!("Sprout daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    let recipe = recipe
        .map(|path| {
            Recipe::from_file(&path).with_context(|| format!("loading recipe {}", path.display()))
        })
        .transpose()?;
    let setups = setups
        .iter()
        .map(|path| {
            PeripheralSetup::from_file(path)
                .with_context(|| format!("loading setup {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    if !config.bus.simulate {
        warn!("no hardware backend in this build, using the simulated bus");
    }
    let bus = Arc::new(SimulatedBus::new());
    simulate_devices(&bus, &setups)?;

    let mut daemon = Daemon::new(config, bus, Arc::new(SystemClock));
    daemon
        .launch(&DriverRegistry::with_builtin(), setups, recipe, started_at)
        .context("starting daemon")?;
    info!("Sprout daemon ready");

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    control::serve(
        daemon,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        ctrl_c,
    )
    .await
    .context("control loop error")?;

    info!("Sprout daemon stopped");
    Ok(())
}

/// Populate the simulated bus with a device model for every setup whose
/// driver has one, so a run without hardware still produces readings.
fn simulate_devices(bus: &SimulatedBus, setups: &[PeripheralSetup]) -> Result<()> {
    for setup in setups {
        let address = BusAddress::from_communication(&setup.parameters.communication, &setup.name)?;
        let (Some(bus_id), Some(_)) = (address.bus, address.address) else {
            continue;
        };
        if let Some(mux) = address.mux {
            bus.add_mux(bus_id, mux);
        }
        match setup.class_name.as_str() {
            SHT40_CLASS => bus.add_device(address, Sht40Sim::new(22.0, 55.0)),
            BH1750_CLASS => bus.add_device(address, Bh1750Sim::new(12000.0)),
            MCP23017_CLASS => bus.add_device(address, Mcp23017Sim::new()),
            other => warn!(peripheral = %setup.name, class = other, "no simulated device"),
        }
    }
    Ok(())
}

fn check_recipe(file: PathBuf) -> Result<()> {
    let recipe =
        Recipe::from_file(&file).with_context(|| format!("loading recipe {}", file.display()))?;
    for warning in recipe.warnings() {
        println!("warning: {}", warning);
    }

    let scheduler = RecipeScheduler::new(recipe)?;
    let timeline = scheduler.timeline();
    println!("{} ({})", scheduler.recipe().name, scheduler.recipe().uuid);
    for phase in timeline.phases() {
        println!(
            "  {:<24} x{:<4} starts {:>10.3}h  spans {:>10.3}h",
            phase.name,
            phase.repeat,
            phase.start_ms as f64 / 3_600_000.0,
            phase.span_ms() as f64 / 3_600_000.0,
        );
        for cycle in &phase.cycles {
            println!(
                "      {:<20} {:<20} {:>10.3}h",
                cycle.name,
                cycle.environment,
                cycle.duration_ms as f64 / 3_600_000.0,
            );
        }
    }
    println!("total {:.3}h", timeline.total().as_secs_f64() / 3600.0);
    Ok(())
}

fn schedule(file: PathBuf, elapsed: chrono::Duration) -> Result<()> {
    let recipe =
        Recipe::from_file(&file).with_context(|| format!("loading recipe {}", file.display()))?;
    let mut scheduler = RecipeScheduler::new(recipe)?;

    let now = Utc::now();
    scheduler.resume(started_before(now, elapsed)?, now)?;

    let status = scheduler.status(now);
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// The instant `elapsed` before `now`.
fn started_before(now: DateTime<Utc>, elapsed: chrono::Duration) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(elapsed)
        .with_context(|| format!("--elapsed-hours {}h is too far back", elapsed.num_hours()))
}
