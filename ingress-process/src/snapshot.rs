//! Server-state snapshotting ahead of reload/restart.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{io_err, ProcessError};
use crate::runtime::{RuntimeApi, SHOW_SERVERS_STATE};

/// Queries live server state and persists it where the next proxy instance
/// loads it from. Callers treat failures as best-effort.
#[derive(Clone)]
pub struct StateSnapshotter {
    runtime: Arc<dyn RuntimeApi>,
    state_file: PathBuf,
}

impl StateSnapshotter {
    pub fn new(runtime: Arc<dyn RuntimeApi>, state_file: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            state_file: state_file.into(),
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Query → create/truncate → write → fsync → close. Returns bytes written.
    pub fn snapshot(&self) -> Result<usize, ProcessError> {
        let state = self.runtime.execute_raw(SHOW_SERVERS_STATE)?;

        let mut file = File::create(&self.state_file).map_err(|e| io_err(&self.state_file, e))?;
        file.write_all(state.as_bytes())
            .map_err(|e| io_err(&self.state_file, e))?;
        file.sync_all().map_err(|e| io_err(&self.state_file, e))?;
        drop(file);

        tracing::debug!(
            path = %self.state_file.display(),
            bytes = state.len(),
            "server state saved"
        );
        Ok(state.len())
    }
}
