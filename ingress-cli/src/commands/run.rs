//! `ingress-controller run`: the controller itself.

use anyhow::{Context, Result};
use clap::Args;

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Log proxy lifecycle actions instead of executing them.
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load(self.dry_run)?;
        ingress_daemon::start_blocking(config).context("controller exited with error")
    }
}
