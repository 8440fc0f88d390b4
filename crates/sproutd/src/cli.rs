//! Command-line argument parsing.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Sprout grow-enclosure controller
#[derive(Parser)]
#[command(name = "sproutd")]
#[command(about = "Sprout - recipe scheduler and peripheral daemon", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a recipe against a set of peripherals. Reads JSON-lines control
    /// commands on stdin until `shutdown` or Ctrl-C.
    Run {
        /// Recipe document to start with
        #[arg(long)]
        recipe: Option<PathBuf>,

        /// Peripheral setup document (repeatable)
        #[arg(long = "setup")]
        setups: Vec<PathBuf>,

        /// Daemon config (defaults to /etc/sprout/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Resume a recipe that started at this RFC 3339 instant
        #[arg(long)]
        started_at: Option<DateTime<Utc>>,
    },

    /// Validate a recipe and print its phase plan
    CheckRecipe {
        file: PathBuf,
    },

    /// Print where a recipe would be after some elapsed time
    Schedule {
        file: PathBuf,

        /// Hours since the recipe started
        #[arg(long = "elapsed-hours", value_parser = parse_elapsed_hours)]
        elapsed: chrono::Duration,
    },
}

fn parse_elapsed_hours(s: &str) -> Result<chrono::Duration, String> {
    let hours: f64 = s.trim().parse().map_err(|e| format!("{}", e))?;
    if !(hours >= 0.0 && hours.is_finite()) {
        return Err(format!("expected a non-negative number of hours, got {}", s));
    }
    let ms = (hours * 3_600_000.0).round();
    if ms >= i64::MAX as f64 {
        return Err(format!("{} hours is out of range", s));
    }
    chrono::Duration::try_milliseconds(ms as i64)
        .ok_or_else(|| format!("{} hours is out of range", s))
}
