//! JSON-lines control surface.
//!
//! One command object per input line, one reply object per output line:
//!
//! ```text
//! {"command":"event","peripheral":"Heater","name":"Enable Manual Mode"}
//! {"ok":true}
//! {"command":"status"}
//! {"ok":true,"status":{...}}
//! ```

use crate::daemon::Daemon;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sprout_shared::Recipe;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Event {
        peripheral: String,
        name: String,
        #[serde(default)]
        value: Option<Value>,
    },
    StartRecipe {
        /// A recipe document, or the path of one.
        recipe: Value,
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
    },
    StopRecipe,
    Status,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Execute one command line against the daemon.
pub async fn handle_line(daemon: &mut Daemon, line: &str) -> (Value, Flow) {
    let command: ControlCommand = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => return (failure(format!("invalid command: {}", e)), Flow::Continue),
    };
    debug!(?command, "control command");

    match command {
        ControlCommand::Event {
            peripheral,
            name,
            value,
        } => match daemon.send_event(&peripheral, &name, value).await {
            Ok(()) => (json!({"ok": true}), Flow::Continue),
            Err(e) => (failure(e), Flow::Continue),
        },
        ControlCommand::StartRecipe { recipe, started_at } => {
            let result = match recipe {
                Value::String(path) => Recipe::from_file(&path),
                doc => Recipe::from_json(&doc.to_string()),
            };
            let result = match result {
                Ok(recipe) => daemon.start_recipe(recipe, started_at).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => (json!({"ok": true}), Flow::Continue),
                Err(e) => (failure(e), Flow::Continue),
            }
        }
        ControlCommand::StopRecipe => {
            let stopped = daemon.stop_recipe().await;
            (json!({"ok": true, "stopped": stopped}), Flow::Continue)
        }
        ControlCommand::Status => match serde_json::to_value(daemon.status()) {
            Ok(status) => (json!({"ok": true, "status": status}), Flow::Continue),
            Err(e) => (failure(e), Flow::Continue),
        },
        ControlCommand::Shutdown => (json!({"ok": true}), Flow::Shutdown),
    }
}

/// Serve commands from `input` until a `shutdown` command or the `shutdown`
/// future resolves, then shut the daemon down. Closed input is not a reason
/// to stop.
pub async fn serve<R, W, S>(mut daemon: Daemon, input: R, mut output: W, shutdown: S) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            line = lines.next_line(), if input_open => {
                let Some(line) = line.context("reading control input")? else {
                    debug!("control input closed");
                    input_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let (reply, flow) = handle_line(&mut daemon, &line).await;
                if reply.get("ok") == Some(&Value::Bool(false)) {
                    warn!(reply = %reply, "command failed");
                }
                output.write_all(format!("{}\n", reply).as_bytes()).await?;
                output.flush().await?;

                if flow == Flow::Shutdown {
                    break;
                }
            }
        }
    }

    daemon.shutdown().await;
    Ok(())
}

fn failure(error: impl std::fmt::Display) -> Value {
    json!({"ok": false, "error": error.to_string()})
}
