//! Desired-state cache.
//!
//! Namespace-scoped view of the resources the controller translates. Events
//! are folded in with [`DesiredState::apply`], which records per-object change
//! status; a reconciliation cycle reads the cache, and only after a successful
//! commit calls [`DesiredState::clean`] to drop deleted objects and reset the
//! remaining statuses.

use std::collections::BTreeMap;

use crate::config::ControllerConfig;
use crate::event::SyncEvent;
use crate::types::{
    GlobalSettings, Ingress, IngressPath, IngressRule, Namespace, Secret, Status,
};

#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    global: GlobalSettings,
    namespaces: BTreeMap<String, Namespace>,
    watch_namespaces: Vec<String>,
}

impl DesiredState {
    /// Empty cache translating only `watch_namespaces` (all when empty).
    pub fn new(watch_namespaces: Vec<String>) -> Self {
        Self {
            global: GlobalSettings::default(),
            namespaces: BTreeMap::new(),
            watch_namespaces,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.watch_namespaces.clone())
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.global
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    /// Namespaces whose resources are translated, in name order.
    pub fn relevant_namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values().filter(|ns| ns.relevant)
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<&Ingress> {
        self.namespaces.get(namespace)?.ingresses.get(name)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<&Secret> {
        self.namespaces.get(namespace)?.secrets.get(name)
    }

    /// Fold one event into the cache. Returns `true` when anything changed.
    pub fn apply(&mut self, event: SyncEvent) -> bool {
        match event {
            SyncEvent::Namespace { name, status } => self.apply_namespace(name, status),
            SyncEvent::Ingress(ingress) => self.apply_ingress(ingress),
            SyncEvent::Secret(secret) => self.apply_secret(secret),
            SyncEvent::Global(annotations) => {
                if self.global.annotations == annotations {
                    return false;
                }
                self.global.annotations = annotations;
                self.global.status = Status::Modified;
                true
            }
            SyncEvent::Resync => false,
        }
    }

    /// Post-commit cleanup: drop every `Deleted` object, reset the rest to `Empty`.
    pub fn clean(&mut self) {
        self.global.status = Status::Empty;
        self.namespaces.retain(|_, ns| !ns.status.is_deleted());
        for ns in self.namespaces.values_mut() {
            ns.status = Status::Empty;
            ns.secrets.retain(|_, secret| !secret.status.is_deleted());
            for secret in ns.secrets.values_mut() {
                secret.status = Status::Empty;
            }
            ns.ingresses.retain(|_, ingress| !ingress.status.is_deleted());
            for ingress in ns.ingresses.values_mut() {
                clean_ingress(ingress);
            }
        }
    }

    fn namespace_mut(&mut self, name: &str) -> &mut Namespace {
        let relevant =
            self.watch_namespaces.is_empty() || self.watch_namespaces.iter().any(|n| n == name);
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Namespace {
                name: name.to_string(),
                relevant,
                status: Status::Added,
                ..Namespace::default()
            })
    }

    fn apply_namespace(&mut self, name: String, status: Status) -> bool {
        if status.is_deleted() {
            let Some(ns) = self.namespaces.get_mut(&name) else {
                return false;
            };
            ns.status = Status::Deleted;
            for ingress in ns.ingresses.values_mut() {
                ingress.mark_all(Status::Deleted);
            }
            for secret in ns.secrets.values_mut() {
                secret.status = Status::Deleted;
            }
            return true;
        }
        let existed = self.namespaces.contains_key(&name);
        let ns = self.namespace_mut(&name);
        if ns.status.is_deleted() {
            ns.status = Status::Modified;
            return true;
        }
        !existed
    }

    fn apply_ingress(&mut self, mut incoming: Ingress) -> bool {
        let name = incoming.name.clone();
        let ns = self.namespace_mut(&incoming.namespace.clone());

        if incoming.status.is_deleted() {
            return match ns.ingresses.get_mut(&name) {
                Some(existing) if !existing.status.is_deleted() => {
                    existing.mark_all(Status::Deleted);
                    true
                }
                _ => false,
            };
        }

        match ns.ingresses.get(&name) {
            Some(existing) if !existing.status.is_deleted() => {
                if existing.same_spec(&incoming) {
                    return false;
                }
                let merged = diff_ingress(existing, incoming);
                ns.ingresses.insert(name, merged);
            }
            _ => {
                incoming.mark_all(Status::Added);
                ns.ingresses.insert(name, incoming);
            }
        }
        true
    }

    fn apply_secret(&mut self, mut incoming: Secret) -> bool {
        let name = incoming.name.clone();
        let ns = self.namespace_mut(&incoming.namespace.clone());

        if incoming.status.is_deleted() {
            return match ns.secrets.get_mut(&name) {
                Some(existing) if !existing.status.is_deleted() => {
                    existing.status = Status::Deleted;
                    true
                }
                _ => false,
            };
        }

        incoming.status = match ns.secrets.get(&name) {
            Some(existing) if !existing.status.is_deleted() => {
                if existing.data == incoming.data {
                    return false;
                }
                Status::Modified
            }
            _ => Status::Added,
        };
        ns.secrets.insert(name, incoming);
        true
    }
}

/// Merge `incoming` over `existing`, marking what was added, modified or
/// removed. Removed paths and TLS bindings are kept with `Deleted` status so
/// passes can tear down what they produced.
fn diff_ingress(existing: &Ingress, mut incoming: Ingress) -> Ingress {
    incoming.status = Status::Modified;

    incoming.default_backend = match (existing.default_backend.as_ref(), incoming.default_backend) {
        (None, Some(mut new)) => {
            new.status = Status::Added;
            Some(new)
        }
        (Some(old), Some(mut new)) => {
            new.status = path_status(Some(old), &new);
            Some(new)
        }
        (Some(old), None) => {
            let mut gone = old.clone();
            gone.status = Status::Deleted;
            Some(gone)
        }
        (None, None) => None,
    };

    for rule in &mut incoming.rules {
        let old_rule = existing.rules.iter().find(|r| r.host == rule.host);
        rule.status = if old_rule.is_some() {
            Status::Modified
        } else {
            Status::Added
        };
        for path in &mut rule.paths {
            let old_path = old_rule.and_then(|r| r.paths.iter().find(|p| p.path == path.path));
            path.status = path_status(old_path, path);
        }
    }

    for old_rule in &existing.rules {
        for old_path in &old_rule.paths {
            let still_there = incoming
                .rules
                .iter()
                .filter(|r| r.host == old_rule.host)
                .any(|r| r.paths.iter().any(|p| p.path == old_path.path));
            if still_there {
                continue;
            }
            let mut gone = old_path.clone();
            gone.status = Status::Deleted;
            match incoming.rules.iter_mut().find(|r| r.host == old_rule.host) {
                Some(rule) => rule.paths.push(gone),
                None => incoming.rules.push(IngressRule {
                    host: old_rule.host.clone(),
                    paths: vec![gone],
                    status: Status::Deleted,
                }),
            }
        }
    }

    for tls in &mut incoming.tls {
        let unchanged = existing
            .tls
            .iter()
            .any(|old| old.secret_name == tls.secret_name && old.hosts == tls.hosts);
        tls.status = if unchanged {
            Status::Empty
        } else {
            Status::Added
        };
    }
    for old in &existing.tls {
        let kept = incoming
            .tls
            .iter()
            .any(|t| t.secret_name == old.secret_name && t.hosts == old.hosts);
        if !kept {
            let mut gone = old.clone();
            gone.status = Status::Deleted;
            incoming.tls.push(gone);
        }
    }

    incoming
}

fn path_status(old: Option<&IngressPath>, new: &IngressPath) -> Status {
    match old {
        None => Status::Added,
        Some(old) if old.service_name == new.service_name && old.service_port == new.service_port => {
            Status::Empty
        }
        Some(_) => Status::Modified,
    }
}

fn clean_ingress(ingress: &mut Ingress) {
    if ingress
        .default_backend
        .as_ref()
        .is_some_and(|p| p.status.is_deleted())
    {
        ingress.default_backend = None;
    }
    for rule in &mut ingress.rules {
        rule.paths.retain(|p| !p.status.is_deleted());
    }
    ingress
        .rules
        .retain(|r| !r.status.is_deleted() && !r.paths.is_empty());
    ingress.tls.retain(|t| !t.status.is_deleted());
    ingress.mark_all(Status::Empty);
}
