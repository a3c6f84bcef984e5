//! `ingress-controller sync` / `stop`: requests to a running controller.

use anyhow::{bail, Context, Result};
use clap::Args;

use ingress_daemon::{request_stop, request_sync, DaemonError};

use super::ConfigArgs;

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load(false)?;
        let socket = &config.paths.control_socket;
        match request_sync(socket) {
            Ok(summary) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary)
                        .context("failed to render cycle summary JSON")?
                );
                Ok(())
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                bail!("controller is not running (socket {})", socket.display())
            }
            Err(err) => Err(err).context("sync request failed"),
        }
    }
}

#[derive(Args, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

impl StopArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load(false)?;
        match request_stop(&config.paths.control_socket) {
            Ok(()) => println!("controller stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("controller is not running"),
            Err(err) => return Err(err).context("failed to stop controller"),
        }
        Ok(())
    }
}
