use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use ingress_core::{ControllerConfig, SyncEvent};
use ingress_process::{Liveness, ServiceAction, ServiceControl, Supervisor};
use ingress_sync::{CycleReport, Reconciler, SyncError};

use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse, CMD_STATUS, CMD_STOP, CMD_SYNC};
use crate::source::{self, ManifestSource};

/// Outcome of the most recent reconciliation cycle, as published to the
/// control socket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    /// Cycles run since startup; `0` until the first one finishes.
    pub cycle: u64,
    pub events: usize,
    pub transaction: Option<u64>,
    pub config_changed: bool,
    pub reload: bool,
    pub restart: bool,
    pub pass_errors: usize,
    pub action: Option<String>,
    pub outcome: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u128,
    pub finished_at_unix: u64,
}

impl CycleSummary {
    fn from_result(
        cycle: u64,
        events: usize,
        result: &Result<CycleReport, SyncError>,
        started: Instant,
    ) -> Self {
        let mut summary = Self {
            cycle,
            events,
            duration_ms: started.elapsed().as_millis(),
            finished_at_unix: unix_seconds_now(),
            ..Self::default()
        };
        match result {
            Ok(report) => {
                summary.transaction = Some(report.transaction.0);
                summary.config_changed = report.config_changed;
                summary.reload = report.decision.reload;
                summary.restart = report.decision.restart;
                summary.pass_errors = report.pass_errors;
                if let Some((action, outcome)) = &report.outcome {
                    summary.action = Some(action.to_string());
                    match outcome {
                        Ok(outcome) => summary.outcome = Some(outcome.to_string()),
                        Err(err) => summary.error = Some(err.clone()),
                    }
                }
            }
            Err(err) => summary.error = Some(err.to_string()),
        }
        summary
    }
}

/// Start the controller runtime and block the current thread until it exits.
pub fn start_blocking(config: ControllerConfig) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the controller: prepare the proxy, then drive the manifest source,
/// the event loop and the control socket until shutdown.
pub async fn run(config: ControllerConfig) -> Result<(), DaemonError> {
    config.verify_base_config()?;
    config.ensure_dirs()?;
    let config = Arc::new(config);

    let supervisor = Arc::new(Supervisor::from_config(&config));
    match supervisor.proxy_version() {
        Some(version) => tracing::info!(%version, "proxy binary found"),
        None => tracing::warn!(binary = %config.proxy_binary, "could not determine proxy version"),
    }
    let outcome = supervisor.run(ServiceAction::Start)?;
    tracing::info!(%outcome, "proxy startup");

    let reconciler = Reconciler::from_config(Arc::clone(&config), supervisor.clone());
    let started_at_unix = unix_seconds_now();

    let (event_tx, event_rx) = mpsc::channel::<SyncEvent>(config.event_buffer);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (cycle_tx, cycle_rx) = watch::channel(CycleSummary::default());

    let source_handle = {
        let shutdown = shutdown_tx.clone();
        let source = ManifestSource::new(&config.paths.resources_dir);
        let event_tx = event_tx.clone();
        let resync = config.resync_interval;
        tokio::spawn(async move {
            let result = source::watch_task(source, event_tx, resync, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let loop_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = event_loop_task(reconciler, event_rx, cycle_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state = ControlState {
            config: Arc::clone(&config),
            supervisor,
            events: event_tx,
            cycles: cycle_rx,
            started_at_unix,
        };
        tokio::spawn(async move {
            let result = socket_server_task(state, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            let result = signal_task(&mut shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let (source_result, loop_result, socket_result, signal_result) =
        tokio::join!(source_handle, loop_handle, socket_handle, signal_handle);

    handle_join("manifest_source", source_result)?;
    handle_join("event_loop", loop_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("controller stopped");
    Ok(())
}

async fn signal_task(shutdown_rx: &mut broadcast::Receiver<()>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())
        .map_err(|err| DaemonError::Protocol(format!("SIGTERM handler failed: {err}")))?;
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down controller");
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down controller");
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Single reconciliation worker. Waits for one event, drains whatever else
/// is queued, folds the batch into the cache and runs exactly one cycle on
/// the blocking pool. Shutdown is only observed between cycles.
async fn event_loop_task(
    mut reconciler: Reconciler,
    mut events: mpsc::Receiver<SyncEvent>,
    cycles: watch::Sender<CycleSummary>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut cycle = 0u64;

    loop {
        let first = tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let mut batch = vec![first];
        while let Ok(event) = events.try_recv() {
            batch.push(event);
        }

        let started = Instant::now();
        let count = batch.len();
        let (returned, result) = tokio::task::spawn_blocking(move || {
            for event in batch {
                let label = event.describe();
                if reconciler.apply(event) {
                    tracing::debug!(event = %label, "cache updated");
                }
            }
            let result = reconciler.cycle();
            (reconciler, result)
        })
        .await
        .map_err(|err| DaemonError::Protocol(format!("reconciliation task join error: {err}")))?;
        reconciler = returned;

        cycle += 1;
        match &result {
            Ok(report) => tracing::info!(
                cycle,
                events = count,
                transaction = report.transaction.0,
                config_changed = report.config_changed,
                pass_errors = report.pass_errors,
                "reconciliation cycle completed",
            ),
            Err(err) => tracing::error!(cycle, error = %err, "reconciliation cycle failed"),
        }
        cycles.send_replace(CycleSummary::from_result(cycle, count, &result, started));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ControlState {
    config: Arc<ControllerConfig>,
    supervisor: Arc<Supervisor>,
    events: mpsc::Sender<SyncEvent>,
    cycles: watch::Receiver<CycleSummary>,
    started_at_unix: u64,
}

async fn socket_server_task(
    state: ControlState,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = state.config.paths.control_socket.clone();
    if let Some(parent) = socket.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: ControlState,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("control socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            CMD_STATUS => DaemonResponse::ok(build_status_payload(&state)),
            CMD_SYNC => match request_cycle(&state.events, state.cycles.clone()).await {
                Ok(summary) => DaemonResponse::ok(json!(summary)),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            CMD_STOP => {
                tracing::info!("stop requested over control socket");
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == CMD_STOP {
            break;
        }
    }

    Ok(())
}

fn build_status_payload(state: &ControlState) -> Value {
    let last_cycle = state.cycles.borrow().clone();
    let proxy = match state.supervisor.liveness() {
        Liveness::Alive(pid) => json!({ "state": "running", "pid": pid }),
        Liveness::Dead(pid) => json!({ "state": "dead", "pid": pid }),
        Liveness::NotFound => json!({ "state": "not_found" }),
    };
    let paths = &state.config.paths;

    json!({
        "running": true,
        "started_at_unix": state.started_at_unix,
        "dry_run": state.config.dry_run,
        "proxy": proxy,
        "last_cycle": if last_cycle.cycle == 0 { Value::Null } else { json!(last_cycle) },
        "socket": paths.control_socket.display().to_string(),
        "config_file": paths.config_file.display().to_string(),
        "resources_dir": paths.resources_dir.display().to_string(),
    })
}

/// Queue a resync and wait until a cycle completes after it was queued.
async fn request_cycle(
    events: &mpsc::Sender<SyncEvent>,
    mut cycles: watch::Receiver<CycleSummary>,
) -> Result<CycleSummary, DaemonError> {
    let before = cycles.borrow_and_update().cycle;
    events
        .send(SyncEvent::Resync)
        .await
        .map_err(|_| DaemonError::ChannelClosed("event queue"))?;

    loop {
        cycles
            .changed()
            .await
            .map_err(|_| DaemonError::ChannelClosed("cycle status"))?;
        let summary = cycles.borrow_and_update().clone();
        if summary.cycle > before {
            return Ok(summary);
        }
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => Err(DaemonError::Protocol(format!(
            "controller already running (socket in use: {})",
            socket.display()
        ))),
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::ConnectionReset
            ) =>
        {
            fs::remove_file(socket).map_err(|e| io_err(socket, e))
        }
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("control socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
