//! File-backed resource source.
//!
//! Layout under `resources_dir`:
//!
//! ```text
//! <resources_dir>/global.yaml            kind: Global
//! <resources_dir>/<namespace>/*.yaml     kind: Ingress | Secret
//! ```
//!
//! Each rescan reads the whole tree, diffs it against the previous scan and
//! turns the difference into [`SyncEvent`]s. A file that fails to parse keeps
//! contributing whatever it held at the previous scan, so a half-written
//! manifest never looks like a deletion.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use ingress_core::{Ingress, IngressPath, IngressRule, IngressTls, Secret, Status, SyncEvent};

use crate::error::{io_err, DaemonError};

/// Quiet period after the last filesystem event before rescanning.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Manifest format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    Ingress(IngressManifest),
    Secret(SecretManifest),
    Global(GlobalManifest),
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressManifest {
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub default_backend: Option<IngressPath>,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(default)]
    pub tls: Vec<IngressTls>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretManifest {
    pub name: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Process-wide settings. Scalar values of any YAML type are accepted and
/// kept in their string form.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalManifest {
    #[serde(default)]
    pub data: BTreeMap<String, serde_yaml::Value>,
}

impl GlobalManifest {
    fn settings(&self, path: &Path) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();
        for (key, value) in &self.data {
            let text = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                _ => {
                    tracing::warn!(
                        path = %path.display(),
                        key = %key,
                        "ignoring non-scalar global setting"
                    );
                    continue;
                }
            };
            settings.insert(key.clone(), text);
        }
        settings
    }
}

pub fn parse_manifest(path: &Path) -> Result<Manifest, DaemonError> {
    let raw = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&raw).map_err(|source| DaemonError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// What one manifest file contributed to a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Loaded {
    Ingress(Ingress),
    Secret(Secret),
    Global(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    namespaces: BTreeSet<String>,
    files: BTreeMap<PathBuf, Loaded>,
}

type ObjectKey = (String, String);

impl Snapshot {
    fn ingresses(&self) -> BTreeMap<ObjectKey, &Ingress> {
        let mut out = BTreeMap::new();
        for (path, loaded) in &self.files {
            if let Loaded::Ingress(ingress) = loaded {
                let key = (ingress.namespace.clone(), ingress.name.clone());
                if out.insert(key, ingress).is_some() {
                    tracing::warn!(
                        path = %path.display(),
                        ingress = %ingress.key(),
                        "duplicate ingress manifest, last file wins"
                    );
                }
            }
        }
        out
    }

    fn secrets(&self) -> BTreeMap<ObjectKey, &Secret> {
        let mut out = BTreeMap::new();
        for (path, loaded) in &self.files {
            if let Loaded::Secret(secret) = loaded {
                let key = (secret.namespace.clone(), secret.name.clone());
                if out.insert(key, secret).is_some() {
                    tracing::warn!(
                        path = %path.display(),
                        secret = %secret.key(),
                        "duplicate secret manifest, last file wins"
                    );
                }
            }
        }
        out
    }

    fn global(&self) -> BTreeMap<String, String> {
        self.files
            .values()
            .find_map(|loaded| match loaded {
                Loaded::Global(settings) => Some(settings.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

fn is_manifest(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, DaemonError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(dir, err)),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

// ---------------------------------------------------------------------------
// ManifestSource
// ---------------------------------------------------------------------------

pub struct ManifestSource {
    root: PathBuf,
    known: Snapshot,
}

impl ManifestSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            known: Snapshot::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the tree and return the events that bring a consumer from the
    /// previous scan to the current one. The first call reports everything.
    pub fn rescan(&mut self) -> Result<Vec<SyncEvent>, DaemonError> {
        let current = self.scan()?;
        let events = diff(&self.known, &current);
        self.known = current;
        Ok(events)
    }

    fn scan(&self) -> Result<Snapshot, DaemonError> {
        let mut snapshot = Snapshot::default();
        for path in sorted_entries(&self.root)? {
            if path.is_dir() {
                let Some(namespace) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if namespace.starts_with('.') {
                    continue;
                }
                snapshot.namespaces.insert(namespace.to_string());
                for file in sorted_entries(&path)? {
                    if is_manifest(&file) {
                        self.load(&file, Some(namespace), &mut snapshot);
                    }
                }
            } else if is_manifest(&path) {
                self.load(&path, None, &mut snapshot);
            }
        }
        Ok(snapshot)
    }

    fn load(&self, path: &Path, namespace: Option<&str>, snapshot: &mut Snapshot) {
        let manifest = match parse_manifest(path) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable manifest");
                if let Some(previous) = self.known.files.get(path) {
                    snapshot.files.insert(path.to_path_buf(), previous.clone());
                }
                return;
            }
        };

        let loaded = match (manifest, namespace) {
            (Manifest::Global(global), None) => Loaded::Global(global.settings(path)),
            (Manifest::Ingress(m), Some(ns)) => Loaded::Ingress(Ingress {
                namespace: ns.to_string(),
                name: m.name,
                annotations: m.annotations,
                default_backend: m.default_backend,
                rules: m.rules,
                tls: m.tls,
                status: Status::Added,
            }),
            (Manifest::Secret(m), Some(ns)) => Loaded::Secret(Secret {
                namespace: ns.to_string(),
                name: m.name,
                data: m.data,
                status: Status::Added,
            }),
            (Manifest::Global(_), Some(_)) => {
                tracing::warn!(
                    path = %path.display(),
                    "global settings belong at the top of the resources directory"
                );
                return;
            }
            (_, None) => {
                tracing::warn!(
                    path = %path.display(),
                    "ingress and secret manifests must live in a namespace directory"
                );
                return;
            }
        };
        snapshot.files.insert(path.to_path_buf(), loaded);
    }
}

/// Events ordered global, namespace additions, secrets, ingresses, then
/// deletions and finally namespace removals.
fn diff(before: &Snapshot, after: &Snapshot) -> Vec<SyncEvent> {
    let mut events = Vec::new();

    let (old_global, new_global) = (before.global(), after.global());
    if old_global != new_global {
        events.push(SyncEvent::Global(new_global));
    }

    for ns in after.namespaces.difference(&before.namespaces) {
        events.push(SyncEvent::Namespace {
            name: ns.clone(),
            status: Status::Added,
        });
    }

    let (old_secrets, new_secrets) = (before.secrets(), after.secrets());
    for (key, secret) in &new_secrets {
        let status = match old_secrets.get(key) {
            None => Status::Added,
            Some(old) if old.data != secret.data => Status::Modified,
            Some(_) => continue,
        };
        events.push(SyncEvent::Secret(Secret {
            status,
            ..(*secret).clone()
        }));
    }

    let (old_ingresses, new_ingresses) = (before.ingresses(), after.ingresses());
    for (key, ingress) in &new_ingresses {
        let status = match old_ingresses.get(key) {
            None => Status::Added,
            Some(old) if !old.same_spec(ingress) => Status::Modified,
            Some(_) => continue,
        };
        let mut ingress = (*ingress).clone();
        ingress.status = status;
        events.push(SyncEvent::Ingress(ingress));
    }

    // Objects of a removed namespace go away with the namespace event.
    let removed: BTreeSet<&String> = before.namespaces.difference(&after.namespaces).collect();

    for (key, secret) in &old_secrets {
        if !new_secrets.contains_key(key) && !removed.contains(&key.0) {
            events.push(SyncEvent::Secret(Secret {
                status: Status::Deleted,
                ..(*secret).clone()
            }));
        }
    }
    for (key, ingress) in &old_ingresses {
        if !new_ingresses.contains_key(key) && !removed.contains(&key.0) {
            let mut ingress = (*ingress).clone();
            ingress.status = Status::Deleted;
            events.push(SyncEvent::Ingress(ingress));
        }
    }

    for ns in removed {
        events.push(SyncEvent::Namespace {
            name: ns.clone(),
            status: Status::Deleted,
        });
    }

    events
}

// ---------------------------------------------------------------------------
// Watcher task
// ---------------------------------------------------------------------------

/// Trailing-edge debounce: fires once [`DEBOUNCE_WINDOW`] after the last touch.
#[derive(Debug)]
struct Debounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    fn touch(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    fn is_due(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    fn clear(&mut self) {
        self.deadline = None;
    }
}

async fn sleep_until_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Periodic resync ticker; the first tick is one full period away.
fn resync_ticker(period: Option<Duration>) -> Option<Interval> {
    let period = period?;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(interval)
}

async fn next_resync(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Scan, then watch the tree and rescan after every quiet period, pushing the
/// resulting events into the event channel. Every `resync` period a
/// [`SyncEvent::Resync`] is pushed as well, so failed passes get retried
/// without a manifest change. Awaits when the channel is full.
pub async fn watch_task(
    source: ManifestSource,
    events: mpsc::Sender<SyncEvent>,
    resync: Option<Duration>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = source.root().to_path_buf();
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = fs_tx.send(event);
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    tracing::info!(path = %root.display(), "watching resource manifests");

    let mut debounce = Debounce::new(DEBOUNCE_WINDOW);
    let mut ticker = resync_ticker(resync);
    let (mut source, mut open) = publish(source, &events).await?;

    while open {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = fs_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    Ok(event) if is_relevant_event_kind(&event.kind) => debounce.touch(),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "watcher event error"),
                }
            }
            _ = sleep_until_due(debounce.deadline) => {
                debounce.clear();
                (source, open) = publish(source, &events).await?;
            }
            _ = next_resync(&mut ticker) => {
                tracing::debug!("periodic resync");
                open = events.send(SyncEvent::Resync).await.is_ok();
            }
        }
    }

    Ok(())
}

/// Rescan on the blocking pool and forward the events. Returns `false` when
/// the event loop has gone away.
async fn publish(
    mut source: ManifestSource,
    events: &mpsc::Sender<SyncEvent>,
) -> Result<(ManifestSource, bool), DaemonError> {
    let (source, batch) = tokio::task::spawn_blocking(move || {
        let batch = source.rescan();
        (source, batch)
    })
    .await
    .map_err(|err| DaemonError::Protocol(format!("manifest scan join error: {err}")))?;

    let batch = match batch {
        Ok(batch) => batch,
        Err(err) => {
            tracing::error!(error = %err, "manifest scan failed");
            return Ok((source, true));
        }
    };
    if !batch.is_empty() {
        tracing::debug!(events = batch.len(), "manifest changes detected");
    }
    for event in batch {
        if events.send(event).await.is_err() {
            return Ok((source, false));
        }
    }
    Ok((source, true))
}
