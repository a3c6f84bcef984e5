use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the proxy supervisor, PID handling, and the runtime channel.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("runtime API at {socket}: {source}")]
    Runtime {
        socket: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime API returned an empty response to '{0}'")]
    EmptyRuntimeResponse(String),

    /// Not a runtime failure: the caller named an action that does not exist.
    #[error("unknown proxy action '{0}'; expected: start, stop, reload, restart")]
    UnknownAction(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ProcessError {
    ProcessError::Io {
        path: path.into(),
        source,
    }
}
