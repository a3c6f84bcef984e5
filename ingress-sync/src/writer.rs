//! Hash-gated atomic writes for every file the controller owns (the live
//! configuration, map files, certificate bundles).
//!
//! ## `atomic_write`
//!
//! 1. Normalise line endings and SHA-256 hash the content.
//! 2. Compare with the digest recorded in the [`HashStore`]; when the store has
//!    no entry yet, compare with the file currently on disk.
//! 3. Skip if identical.
//! 4. Write to `<path>.ingress.tmp`, then rename over the final path.
//! 5. Record the new digest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{io_err, SyncError};

/// Path (lossy string) → SHA-256 hex digest of the last content written there.
pub type HashStore = HashMap<String, String>;

/// Outcome of an individual file write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// File was written (content changed or did not previously exist).
    Written { path: PathBuf },
    /// File was skipped: content matches the recorded digest.
    Unchanged { path: PathBuf },
}

impl WriteResult {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteResult::Written { .. })
    }
}

pub fn content_digest(content: &str) -> String {
    let mut h = Sha256::new();
    h.update(content.as_bytes());
    hex::encode(h.finalize())
}

/// Atomically write `content` to `path` unless it is already there.
pub fn atomic_write(
    path: &Path,
    content: &str,
    store: &mut HashStore,
) -> Result<WriteResult, SyncError> {
    let tmp = PathBuf::from(format!("{}.ingress.tmp", path.display()));
    atomic_write_with_tmp(path, content, store, &tmp)
}

fn atomic_write_with_tmp(
    path: &Path,
    content: &str,
    store: &mut HashStore,
    tmp: &Path,
) -> Result<WriteResult, SyncError> {
    let normalized = content.replace("\r\n", "\n");
    let content = normalized.as_str();
    let digest = content_digest(content);

    let key = path.to_string_lossy().to_string();
    let recorded = match store.get(&key) {
        Some(stored) => Some(stored.clone()),
        None => std::fs::read_to_string(path)
            .ok()
            .map(|existing| content_digest(&existing)),
    };
    if recorded.as_deref() == Some(digest.as_str()) {
        tracing::debug!("unchanged: {}", path.display());
        store.insert(key, digest);
        return Ok(WriteResult::Unchanged {
            path: path.to_path_buf(),
        });
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    if let Some(tmp_parent) = tmp.parent() {
        std::fs::create_dir_all(tmp_parent).map_err(|e| io_err(tmp_parent, e))?;
    }
    std::fs::write(tmp, content).map_err(|e| io_err(tmp, e))?;

    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(io_err(path, e));
    }

    store.insert(key, digest);

    tracing::info!("wrote: {}", path.display());
    Ok(WriteResult::Written {
        path: path.to_path_buf(),
    })
}

/// Remove a controller-owned file and forget its digest. Returns `true` when
/// a file was actually removed.
pub fn remove_owned(path: &Path, store: &mut HashStore) -> Result<bool, SyncError> {
    store.remove(path.to_string_lossy().as_ref());
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!("removed: {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(path, e)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
