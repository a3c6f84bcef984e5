//! Ingress status publication to `<state_dir>/status/<namespace>_<ingress>.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ingress_core::{Ingress, PublishService};

use crate::error::{io_err, SyncError};
use crate::passes::StatusPublisher;

/// Document written for each published ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressStatus {
    pub namespace: String,
    pub name: String,
    /// `namespace/name` of the published service.
    pub service: String,
    pub addresses: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

pub struct FileStatusPublisher {
    dir: PathBuf,
}

impl FileStatusPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, namespace: &str, name: &str) -> PathBuf {
        self.dir.join(format!("{namespace}_{name}.json"))
    }

    pub fn read(&self, namespace: &str, name: &str) -> Result<Option<IngressStatus>, SyncError> {
        let path = self.path_for(namespace, name);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}

impl StatusPublisher for FileStatusPublisher {
    /// Skips the write when the stored addresses already match.
    fn publish(&self, ingress: &Ingress, service: &PublishService) -> Result<(), SyncError> {
        let service_key = format!("{}/{}", service.namespace, service.name);
        if let Ok(Some(current)) = self.read(&ingress.namespace, &ingress.name) {
            if current.service == service_key && current.addresses == service.addresses {
                return Ok(());
            }
        }

        let status = IngressStatus {
            namespace: ingress.namespace.clone(),
            name: ingress.name.clone(),
            service: service_key,
            addresses: service.addresses.clone(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&status)?;
        write_replace(&self.path_for(&ingress.namespace, &ingress.name), &json)?;
        tracing::debug!("published status for {}", ingress.key());
        Ok(())
    }
}

fn write_replace(path: &Path, content: &str) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        io_err(path, e)
    })
}
