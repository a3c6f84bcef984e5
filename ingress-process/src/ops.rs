//! OS-level process operations behind a trait seam.
//!
//! The supervisor only ever spawns, signals and probes. [`OsProcessOps`] does
//! that for real; tests substitute a recording fake.

use std::process::{Command, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::ProcessError;

/// Signals understood by the managed proxy's master process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxySignal {
    /// Graceful stop: finish in-flight connections, then exit.
    Stop,
    /// In-place reload: re-read configuration, keep listening sockets.
    Reload,
}

impl ProxySignal {
    pub fn as_nix(self) -> Signal {
        match self {
            ProxySignal::Stop => Signal::SIGUSR1,
            ProxySignal::Reload => Signal::SIGUSR2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProxySignal::Stop => "SIGUSR1",
            ProxySignal::Reload => "SIGUSR2",
        }
    }
}

pub trait ProcessOps: Send + Sync {
    /// Start `program` with `args`, inheriting stdout/stderr. Returns the child pid
    /// without waiting for it to become ready.
    fn spawn(&self, program: &str, args: &[String]) -> Result<u32, ProcessError>;

    fn signal(&self, pid: u32, signal: ProxySignal) -> Result<(), ProcessError>;

    /// Zero-effect liveness probe (signal 0).
    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessOps;

impl ProcessOps for OsProcessOps {
    fn spawn(&self, program: &str, args: &[String]) -> Result<u32, ProcessError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.to_string(),
                source,
            })?;
        let pid = child.id();

        // Reap the child when it exits so a drained master does not linger as a zombie.
        let program = program.to_string();
        std::thread::spawn(move || match child.wait() {
            Ok(status) => tracing::info!(pid, program = %program, %status, "proxy process exited"),
            Err(err) => tracing::warn!(pid, error = %err, "waiting on proxy process failed"),
        });

        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: ProxySignal) -> Result<(), ProcessError> {
        let target = to_nix_pid(pid).ok_or(ProcessError::Signal {
            pid,
            signal: signal.name(),
            source: nix::Error::EINVAL,
        })?;
        kill(target, signal.as_nix()).map_err(|source| ProcessError::Signal {
            pid,
            signal: signal.name(),
            source,
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        to_nix_pid(pid).is_some_and(|target| kill(target, None).is_ok())
    }
}

/// Pid 0 and values above `i32::MAX` would address process groups; reject them.
fn to_nix_pid(pid: u32) -> Option<Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(Pid::from_raw(pid as i32))
}
