//! ingress-controller: keeps a reverse proxy's configuration in step with
//! declared ingress resources.
//!
//! # Usage
//!
//! ```text
//! ingress-controller run [--config <file>] [--dry-run]
//! ingress-controller service start|stop|reload|restart [--config <file>] [--dry-run]
//! ingress-controller check [--config <file>]
//! ingress-controller status [--config <file>] [--json]
//! ingress-controller sync [--config <file>]
//! ingress-controller stop [--config <file>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    check::CheckArgs,
    control::{StopArgs, SyncArgs},
    run::RunArgs,
    service::ServiceArgs,
    status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "ingress-controller",
    version,
    about = "Translate ingress resources into proxy configuration and supervise the proxy",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller in the foreground (manifest watcher + event loop + control socket).
    Run(RunArgs),

    /// Run one proxy lifecycle action directly.
    Service(ServiceArgs),

    /// Validate the controller configuration and show the resolved paths.
    Check(CheckArgs),

    /// Query a running controller over its control socket.
    Status(StatusArgs),

    /// Ask a running controller for a reconciliation cycle and wait for it.
    Sync(SyncArgs),

    /// Ask a running controller to shut down.
    Stop(StopArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Service(args) => args.run(),
        Commands::Check(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Stop(args) => args.run(),
    }
}
