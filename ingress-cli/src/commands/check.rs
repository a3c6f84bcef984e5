//! `ingress-controller check`: resolve the configuration and verify the proxy base config.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Tabled)]
struct PathRow {
    #[tabled(rename = "location")]
    name: &'static str,
    path: String,
    present: String,
}

fn row(name: &'static str, path: &Path) -> PathRow {
    let present = if path.exists() {
        "yes".green().to_string()
    } else {
        "no".yellow().to_string()
    };
    PathRow {
        name,
        path: path.display().to_string(),
        present,
    }
}

impl CheckArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load(false)?;
        let paths = &config.paths;

        println!(
            "ingress-controller v{} | proxy binary '{}' | event buffer {}",
            env!("CARGO_PKG_VERSION"),
            config.proxy_binary,
            config.event_buffer,
        );
        let rows = vec![
            row("config file", &paths.config_file),
            row("pid file", &paths.pid_file),
            row("certificates", &paths.cert_dir),
            row("maps", &paths.map_dir),
            row("state", &paths.state_dir),
            row("transactions", &paths.transaction_dir),
            row("resources", &paths.resources_dir),
            row("runtime socket", &paths.runtime_socket),
            row("control socket", &paths.control_socket),
        ];
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");

        config
            .verify_base_config()
            .context("controller cannot start")?;
        println!("{} configuration ok", "✓".green());
        Ok(())
    }
}
