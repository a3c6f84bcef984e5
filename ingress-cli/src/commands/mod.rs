pub mod check;
pub mod control;
pub mod run;
pub mod service;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use ingress_core::{ConfigFile, ControllerConfig};

/// `--config` shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Controller configuration file (YAML). Built-in defaults apply when omitted.
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn load(&self, dry_run: bool) -> Result<ControllerConfig> {
        let mut file = match &self.config {
            Some(path) => ConfigFile::load(path)
                .with_context(|| format!("failed to load controller config {}", path.display()))?,
            None => ConfigFile::default(),
        };
        if dry_run {
            file.dry_run = true;
        }
        file.resolve().context("invalid controller configuration")
    }
}
