//! Proxy process supervisor.
//!
//! Four actions over the managed proxy, each safe to repeat:
//!
//! | action  | no live process          | live process                         |
//! |---------|--------------------------|--------------------------------------|
//! | start   | spawn                    | `AlreadyRunning`                     |
//! | stop    | `AlreadyStopped`         | graceful stop signal                 |
//! | reload  | snapshot, then start     | snapshot, then reload signal         |
//! | restart | snapshot, then start     | snapshot, then spawn with `-sf <pid>`|
//!
//! Liveness comes from [`crate::pid::resolve`] on every call.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;

use ingress_core::ControllerConfig;

use crate::error::ProcessError;
use crate::ops::{OsProcessOps, ProcessOps, ProxySignal};
use crate::pid::{self, Liveness};
use crate::runtime::SocketRuntime;
use crate::snapshot::StateSnapshotter;

// ---------------------------------------------------------------------------
// Actions and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceAction {
    Start,
    Stop,
    Reload,
    Restart,
}

impl FromStr for ServiceAction {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "reload" => Ok(Self::Reload),
            "restart" => Ok(Self::Restart),
            other => Err(ProcessError::UnknownAction(other.to_string())),
        }
    }
}

impl ServiceAction {
    /// Past participle used in log lines ("proxy would be stopped now").
    pub fn past_tense(self) -> &'static str {
        match self {
            ServiceAction::Start => "started",
            ServiceAction::Stop => "stopped",
            ServiceAction::Reload => "reloaded",
            ServiceAction::Restart => "restarted",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAction::Start => write!(f, "start"),
            ServiceAction::Stop => write!(f, "stop"),
            ServiceAction::Reload => write!(f, "reload"),
            ServiceAction::Restart => write!(f, "restart"),
        }
    }
}

/// What an action actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    Started { pid: u32 },
    Stopped { pid: u32 },
    Reloaded { pid: u32 },
    /// Replacement spawned; `previous` drains and exits on its own.
    Restarted { pid: u32, previous: u32 },
    AlreadyRunning { pid: u32 },
    AlreadyStopped,
    /// Dry-run mode: logged, not executed.
    DryRun(ServiceAction),
}

impl fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceOutcome::Started { pid } => write!(f, "started (pid {pid})"),
            ServiceOutcome::Stopped { pid } => write!(f, "stop requested (pid {pid})"),
            ServiceOutcome::Reloaded { pid } => write!(f, "reloaded (pid {pid})"),
            ServiceOutcome::Restarted { pid, previous } => {
                write!(f, "restarted (pid {pid}, draining {previous})")
            }
            ServiceOutcome::AlreadyRunning { pid } => write!(f, "already running (pid {pid})"),
            ServiceOutcome::AlreadyStopped => write!(f, "already stopped"),
            ServiceOutcome::DryRun(action) => write!(f, "would {action} now (dry run)"),
        }
    }
}

/// The lifecycle surface the reconciliation loop drives.
pub trait ServiceControl: Send + Sync {
    fn run(&self, action: ServiceAction) -> Result<ServiceOutcome, ProcessError>;
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Supervisor {
    binary: String,
    config_file: PathBuf,
    pid_file: PathBuf,
    dry_run: bool,
    ops: Arc<dyn ProcessOps>,
    snapshotter: StateSnapshotter,
}

impl Supervisor {
    pub fn new(
        config: &ControllerConfig,
        ops: Arc<dyn ProcessOps>,
        snapshotter: StateSnapshotter,
    ) -> Self {
        Self {
            binary: config.proxy_binary.clone(),
            config_file: config.paths.config_file.clone(),
            pid_file: config.paths.pid_file.clone(),
            dry_run: config.dry_run,
            ops,
            snapshotter,
        }
    }

    /// Supervisor driving the real proxy: OS process calls, server state
    /// saved through the proxy's runtime socket.
    pub fn from_config(config: &ControllerConfig) -> Self {
        let runtime = Arc::new(SocketRuntime::new(&config.paths.runtime_socket));
        let snapshotter = StateSnapshotter::new(runtime, config.paths.server_state_file());
        Self::new(config, Arc::new(OsProcessOps), snapshotter)
    }

    pub fn liveness(&self) -> Liveness {
        pid::resolve(&self.pid_file, self.ops.as_ref())
    }

    /// Parse and run an action by name.
    pub fn handle(&self, action: &str) -> Result<ServiceOutcome, ProcessError> {
        self.run(action.parse()?)
    }

    pub fn start(&self) -> Result<ServiceOutcome, ProcessError> {
        if let Liveness::Alive(pid) = self.liveness() {
            tracing::warn!(pid, "proxy is already running");
            return Ok(ServiceOutcome::AlreadyRunning { pid });
        }
        let pid = self.ops.spawn(&self.binary, &self.spawn_args(None))?;
        Ok(ServiceOutcome::Started { pid })
    }

    pub fn stop(&self) -> Result<ServiceOutcome, ProcessError> {
        let Some(pid) = self.liveness().live_pid() else {
            tracing::warn!("proxy already stopped");
            return Ok(ServiceOutcome::AlreadyStopped);
        };
        self.ops.signal(pid, ProxySignal::Stop)?;
        Ok(ServiceOutcome::Stopped { pid })
    }

    pub fn reload(&self) -> Result<ServiceOutcome, ProcessError> {
        self.save_server_state();
        let Some(pid) = self.liveness().live_pid() else {
            tracing::warn!("proxy is not running, trying to start it");
            return self.start();
        };
        self.ops.signal(pid, ProxySignal::Reload)?;
        Ok(ServiceOutcome::Reloaded { pid })
    }

    pub fn restart(&self) -> Result<ServiceOutcome, ProcessError> {
        self.save_server_state();
        let Some(previous) = self.liveness().live_pid() else {
            tracing::warn!("proxy is not running, trying to start it");
            return self.start();
        };
        let pid = self
            .ops
            .spawn(&self.binary, &self.spawn_args(Some(previous)))?;
        Ok(ServiceOutcome::Restarted { pid, previous })
    }

    /// `-W -f <config> -p <pidfile>`, plus `-sf <pid>` when taking over sockets.
    pub fn spawn_args(&self, handoff_from: Option<u32>) -> Vec<String> {
        let mut args = vec![
            "-W".to_string(),
            "-f".to_string(),
            self.config_file.display().to_string(),
            "-p".to_string(),
            self.pid_file.display().to_string(),
        ];
        if let Some(pid) = handoff_from {
            args.push("-sf".to_string());
            args.push(pid.to_string());
        }
        args
    }

    /// First line of `<binary> -v`, if the binary can be run at all.
    pub fn proxy_version(&self) -> Option<String> {
        let output = Command::new(&self.binary).arg("-v").output().ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
    }

    fn save_server_state(&self) {
        if let Err(err) = self.snapshotter.snapshot() {
            tracing::warn!(error = %err, "failed to save server state");
        }
    }
}

impl ServiceControl for Supervisor {
    fn run(&self, action: ServiceAction) -> Result<ServiceOutcome, ProcessError> {
        if self.dry_run {
            tracing::info!(%action, "dry run: proxy would be {} now", action.past_tense());
            return Ok(ServiceOutcome::DryRun(action));
        }
        match action {
            ServiceAction::Start => self.start(),
            ServiceAction::Stop => self.stop(),
            ServiceAction::Reload => self.reload(),
            ServiceAction::Restart => self.restart(),
        }
    }
}
