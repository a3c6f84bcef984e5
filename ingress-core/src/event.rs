//! Change events delivered by the resource source to the event loop.

use std::collections::BTreeMap;

use crate::types::{Ingress, Secret, Status};

/// One change observed by the resource source.
///
/// `Ingress` and `Secret` carry their change kind in the object's own
/// `status` field (`Added`, `Modified` or `Deleted`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Namespace { name: String, status: Status },
    Ingress(Ingress),
    Secret(Secret),
    /// Replacement set of process-wide settings.
    Global(BTreeMap<String, String>),
    /// No data change; request a reconciliation cycle anyway.
    Resync,
}

impl SyncEvent {
    /// Short label used in logs.
    pub fn describe(&self) -> String {
        match self {
            SyncEvent::Namespace { name, status } => format!("namespace {name} {status}"),
            SyncEvent::Ingress(ingress) => format!("ingress {} {}", ingress.key(), ingress.status),
            SyncEvent::Secret(secret) => format!("secret {} {}", secret.key(), secret.status),
            SyncEvent::Global(settings) => format!("global settings ({} keys)", settings.len()),
            SyncEvent::Resync => "resync".to_string(),
        }
    }
}
