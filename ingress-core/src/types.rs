//! Domain types for the desired-state cache.
//!
//! Every cached object carries a [`Status`] describing how it changed since the
//! last successful commit. Translation passes read the status to decide what to
//! add, rewrite or remove; the cache resets it after commit.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Change status of a cached object relative to the last committed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Empty,
    Added,
    Modified,
    Deleted,
}

impl Status {
    pub fn is_deleted(self) -> bool {
        self == Status::Deleted
    }

    /// Whether a pass has work to do for an object in this state.
    pub fn is_dirty(self) -> bool {
        self != Status::Empty
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Empty => write!(f, "empty"),
            Status::Added => write!(f, "added"),
            Status::Modified => write!(f, "modified"),
            Status::Deleted => write!(f, "deleted"),
        }
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// A backend service reference: `namespace/name:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

/// The service whose addresses are published into ingress status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishService {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

// ---------------------------------------------------------------------------
// Ingress model
// ---------------------------------------------------------------------------

/// One routed path inside an ingress rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressPath {
    #[serde(default)]
    pub path: String,
    pub service_name: String,
    pub service_port: u16,
    #[serde(default, skip_serializing)]
    pub status: Status,
}

/// A host rule: the host plus its paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IngressRule {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub paths: Vec<IngressPath>,
    #[serde(default, skip_serializing)]
    pub status: Status,
}

/// A TLS binding: hosts served with the certificate held in `secret_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressTls {
    #[serde(default)]
    pub hosts: Vec<String>,
    pub secret_name: String,
    #[serde(default, skip_serializing)]
    pub status: Status,
}

/// A translated ingress resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingress {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub annotations: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub default_backend: Option<IngressPath>,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(default)]
    pub tls: Vec<IngressTls>,
    #[serde(default, skip_serializing)]
    pub status: Status,
}

impl Ingress {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Same resource content, ignoring every status marker.
    pub fn same_spec(&self, other: &Ingress) -> bool {
        strip_status(self.clone()) == strip_status(other.clone())
    }

    /// Mark the ingress and everything below it with `status`.
    pub fn mark_all(&mut self, status: Status) {
        self.status = status;
        if let Some(default) = self.default_backend.as_mut() {
            default.status = status;
        }
        for rule in &mut self.rules {
            rule.status = status;
            for path in &mut rule.paths {
                path.status = status;
            }
        }
        for tls in &mut self.tls {
            tls.status = status;
        }
    }
}

fn strip_status(mut ingress: Ingress) -> Ingress {
    ingress.mark_all(Status::Empty);
    ingress
}

/// A secret holding certificate material (PEM values keyed by `tls.crt` / `tls.key`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub data: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub status: Status,
}

impl Secret {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Concatenated `tls.crt` + `tls.key`, the PEM bundle the proxy loads.
    pub fn pem_bundle(&self) -> Option<String> {
        let crt = self.data.get("tls.crt")?;
        let key = self.data.get("tls.key")?;
        let mut bundle = String::with_capacity(crt.len() + key.len() + 1);
        bundle.push_str(crt.trim_end());
        bundle.push('\n');
        bundle.push_str(key.trim_end());
        bundle.push('\n');
        Some(bundle)
    }
}

/// Process-wide settings (the controller's global config map).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GlobalSettings {
    pub annotations: std::collections::BTreeMap<String, String>,
    pub status: Status,
}

impl GlobalSettings {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.annotations.get(name).map(String::as_str)
    }
}

/// A namespace and the resources cached for it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Namespace {
    pub name: String,
    /// Whether resources in this namespace are translated at all.
    pub relevant: bool,
    pub ingresses: std::collections::BTreeMap<String, Ingress>,
    pub secrets: std::collections::BTreeMap<String, Secret>,
    pub status: Status,
}
