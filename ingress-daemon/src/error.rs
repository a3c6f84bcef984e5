use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the controller runtime, manifest source and control protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] ingress_core::ConfigError),

    #[error("sync error: {0}")]
    Sync(#[from] ingress_sync::SyncError),

    #[error("proxy lifecycle error: {0}")]
    Process(#[from] ingress_process::ProcessError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("controller protocol error: {0}")]
    Protocol(String),

    #[error("controller is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
