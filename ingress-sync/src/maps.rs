//! Map files consumed by the proxy's frontends (`map_beg`, `map_str`).
//!
//! Entries are collected fresh during every cycle; [`MapFiles::refresh`]
//! renders each map sorted by key, writes only the files whose content
//! changed. Entry sets are emptied for the next cycle even when a write
//! fails. A map that once existed and received no entries is rewritten empty.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::SyncError;
use crate::writer::{atomic_write, HashStore};

/// Host + path prefix → backend name.
pub const HOST_PATH_MAP: &str = "host-path";
/// Path prefix → backend name, for rules without a host.
pub const PATH_MAP: &str = "path";

pub struct MapFiles {
    dir: PathBuf,
    maps: BTreeMap<String, BTreeMap<String, String>>,
    hashes: HashStore,
}

impl MapFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            maps: BTreeMap::new(),
            hashes: HashStore::new(),
        }
    }

    pub fn path_of(&self, map: &str) -> PathBuf {
        self.dir.join(format!("{map}.map"))
    }

    /// Add (or overwrite) one entry for the current cycle.
    pub fn insert(&mut self, map: &str, key: impl Into<String>, value: impl Into<String>) {
        self.maps
            .entry(map.to_string())
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn entries(&self, map: &str) -> Option<&BTreeMap<String, String>> {
        self.maps.get(map)
    }

    /// Write every map whose rendered content changed. Returns `true` when at
    /// least one file was written, or the first write error once every map
    /// has been attempted.
    pub fn refresh(&mut self) -> Result<bool, SyncError> {
        let mut changed = false;
        let mut failed = None;
        for (name, entries) in &mut self.maps {
            let entries = std::mem::take(entries);
            let mut content = String::new();
            for (key, value) in entries.iter() {
                content.push_str(key);
                content.push(' ');
                content.push_str(value);
                content.push('\n');
            }
            let path = self.dir.join(format!("{name}.map"));
            match atomic_write(&path, &content, &mut self.hashes) {
                Ok(result) => changed |= result.is_written(),
                Err(e) => {
                    failed.get_or_insert(e);
                }
            }
        }
        match failed {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }
}
