//! `ingress-controller status`: runtime view of a running controller.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use ingress_daemon::{request_status, DaemonError};

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load(false)?;
        let socket = &config.paths.control_socket;

        let status = match request_status(socket) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => json!({
                "running": false,
                "socket": socket.display().to_string(),
            }),
            Err(err) => return Err(err).context("failed to query controller status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render controller status JSON")?
            );
        } else {
            print_table(&status);
        }
        Ok(())
    }
}

#[derive(Tabled)]
struct CycleRow {
    field: &'static str,
    value: String,
}

const CYCLE_FIELDS: [&str; 11] = [
    "cycle",
    "events",
    "transaction",
    "config_changed",
    "reload",
    "restart",
    "pass_errors",
    "action",
    "outcome",
    "error",
    "duration_ms",
];

fn print_table(status: &Value) {
    if status["running"] != json!(true) {
        println!(
            "{} controller is not running (socket {})",
            "●".red(),
            status["socket"].as_str().unwrap_or("?"),
        );
        return;
    }

    let proxy = match (status["proxy"]["state"].as_str(), status["proxy"]["pid"].as_u64()) {
        (Some("running"), Some(pid)) => format!("proxy running (pid {pid})").green(),
        (Some("dead"), Some(pid)) => format!("proxy dead (stale pid {pid})").red(),
        _ => "proxy not running".yellow(),
    };
    let mode = if status["dry_run"] == json!(true) {
        " | dry run"
    } else {
        ""
    };
    println!(
        "{} controller running | {proxy}{mode}",
        "●".green(),
    );

    let cycle = &status["last_cycle"];
    if cycle.is_null() {
        println!("No reconciliation cycle has completed yet.");
        return;
    }

    let rows: Vec<CycleRow> = CYCLE_FIELDS
        .iter()
        .map(|&field| CycleRow {
            field,
            value: render_value(&cycle[field]),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_values_render_as_dash() {
        assert_eq!(render_value(&Value::Null), "-");
        assert_eq!(render_value(&json!("reload")), "reload");
        assert_eq!(render_value(&json!(3)), "3");
        assert_eq!(render_value(&json!(false)), "false");
    }
}
