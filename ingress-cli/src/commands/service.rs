//! `ingress-controller service <action>`: one-shot proxy lifecycle action.

use anyhow::{Context, Result};
use clap::Args;

use ingress_process::Supervisor;

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct ServiceArgs {
    /// One of: start, stop, reload, restart.
    pub action: String,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Report what would happen without touching the proxy.
    #[arg(long)]
    pub dry_run: bool,
}

impl ServiceArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load(self.dry_run)?;
        let supervisor = Supervisor::from_config(&config);
        let outcome = supervisor
            .handle(&self.action)
            .with_context(|| format!("proxy {} failed", self.action))?;
        println!("proxy {outcome}");
        Ok(())
    }
}
