//! Process handle resolution from the PID record.
//!
//! The handle is re-derived on every call and never cached: the proxy can be
//! replaced underneath us (handoff restart, master re-exec) between two
//! lifecycle actions.

use std::fs;
use std::path::Path;

use crate::ops::ProcessOps;

/// Result of resolving the managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The PID record names a process that answered the liveness probe.
    Alive(u32),
    /// The PID record names a process that no longer exists (stale record).
    Dead(u32),
    /// No PID record, or its content is not a usable pid.
    NotFound,
}

impl Liveness {
    pub fn live_pid(self) -> Option<u32> {
        match self {
            Liveness::Alive(pid) => Some(pid),
            Liveness::Dead(_) | Liveness::NotFound => None,
        }
    }
}

/// Read the first line of `pid_file` as a process id.
pub fn read_pid(pid_file: &Path) -> Option<u32> {
    let contents = fs::read_to_string(pid_file).ok()?;
    let pid: u32 = contents.lines().next()?.trim().parse().ok()?;
    (pid != 0).then_some(pid)
}

/// Resolve the managed process: PID record → pid → liveness probe.
pub fn resolve(pid_file: &Path, ops: &dyn ProcessOps) -> Liveness {
    match read_pid(pid_file) {
        None => Liveness::NotFound,
        Some(pid) if ops.is_alive(pid) => Liveness::Alive(pid),
        Some(pid) => Liveness::Dead(pid),
    }
}
