//! Controller configuration.
//!
//! The on-disk [`ConfigFile`] is YAML with every field optional. It is resolved
//! exactly once at startup into an immutable [`ControllerConfig`], which is then
//! shared (by reference or `Arc`) with every component that needs a path or a
//! setting. Nothing in the workspace mutates configuration after resolution.
//!
//! # Defaults
//!
//! ```text
//! config_dir      /etc/haproxy
//! config_file     <config_dir>/haproxy.cfg
//! cert_dir        <config_dir>/certs
//! map_dir         <config_dir>/maps
//! transaction_dir <config_dir>/transactions
//! pid_file        /var/run/haproxy.pid
//! runtime_socket  /var/run/haproxy-runtime-api.sock
//! state_dir       /var/state/haproxy/
//! control_socket  <state_dir>/controller.sock
//! resources_dir   <config_dir>/resources
//! resync_interval_secs 60 (0 disables the periodic resync)
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::{PublishService, ServiceRef};

pub const DEFAULT_CONFIG_DIR: &str = "/etc/haproxy";
pub const DEFAULT_PID_FILE: &str = "/var/run/haproxy.pid";
pub const DEFAULT_RUNTIME_SOCKET: &str = "/var/run/haproxy-runtime-api.sock";
pub const DEFAULT_STATE_DIR: &str = "/var/state/haproxy/";
pub const DEFAULT_PROXY_BINARY: &str = "haproxy";

/// Buffered event channel capacity (six times the platform watch channel size of 100).
pub const DEFAULT_EVENT_BUFFER: usize = 600;

/// Seconds between periodic resync events.
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 60;

/// File name of the persisted server-state blob inside `state_dir`.
pub const SERVER_STATE_FILE: &str = "global";

// ---------------------------------------------------------------------------
// On-disk form
// ---------------------------------------------------------------------------

/// Raw controller configuration as written by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub config_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub cert_dir: Option<PathBuf>,
    pub map_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub transaction_dir: Option<PathBuf>,
    pub runtime_socket: Option<PathBuf>,
    pub control_socket: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
    pub proxy_binary: Option<String>,
    /// Command run against a candidate configuration before commit.
    /// The literal `{file}` is replaced by the candidate path.
    pub validate_command: Option<Vec<String>>,
    pub publish_service: Option<PublishService>,
    /// Namespaces to translate. Empty means every namespace.
    pub watch_namespaces: Vec<String>,
    pub default_backend: Option<ServiceRef>,
    /// `namespace/name` of the secret used when no ingress provides a certificate.
    pub default_certificate: Option<String>,
    pub event_buffer: Option<usize>,
    /// Seconds between resync events that re-run a cycle without any change.
    pub resync_interval_secs: Option<u64>,
    pub dry_run: bool,
}

impl ConfigFile {
    /// Load a config file from `path`.
    ///
    /// Returns `ConfigError::Io` if the file cannot be read and
    /// `ConfigError::Parse` (with path + line context) if it is malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fill every unset field with its default and freeze the result.
    pub fn resolve(self) -> Result<ControllerConfig, ConfigError> {
        let config_dir = self
            .config_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));
        let state_dir = self
            .state_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));

        let event_buffer = self.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER);
        if event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer must be greater than zero".to_string(),
            ));
        }
        if let Some(cmd) = &self.validate_command {
            if cmd.is_empty() {
                return Err(ConfigError::Invalid(
                    "validate_command must name a program".to_string(),
                ));
            }
        }

        let paths = ProxyPaths {
            config_file: self
                .config_file
                .unwrap_or_else(|| config_dir.join("haproxy.cfg")),
            cert_dir: self.cert_dir.unwrap_or_else(|| config_dir.join("certs")),
            map_dir: self.map_dir.unwrap_or_else(|| config_dir.join("maps")),
            transaction_dir: self
                .transaction_dir
                .unwrap_or_else(|| config_dir.join("transactions")),
            resources_dir: self
                .resources_dir
                .unwrap_or_else(|| config_dir.join("resources")),
            pid_file: self
                .pid_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
            runtime_socket: self
                .runtime_socket
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_SOCKET)),
            control_socket: self
                .control_socket
                .unwrap_or_else(|| state_dir.join("controller.sock")),
            config_dir,
            state_dir,
        };

        Ok(ControllerConfig {
            paths,
            proxy_binary: self
                .proxy_binary
                .unwrap_or_else(|| DEFAULT_PROXY_BINARY.to_string()),
            validate_command: self.validate_command,
            publish_service: self.publish_service,
            watch_namespaces: self.watch_namespaces,
            default_backend: self.default_backend,
            default_certificate: self.default_certificate,
            event_buffer,
            resync_interval: match self
                .resync_interval_secs
                .unwrap_or(DEFAULT_RESYNC_INTERVAL_SECS)
            {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            dry_run: self.dry_run,
        })
    }
}

// ---------------------------------------------------------------------------
// Resolved form
// ---------------------------------------------------------------------------

/// Every filesystem location the controller touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub pid_file: PathBuf,
    pub cert_dir: PathBuf,
    pub map_dir: PathBuf,
    pub state_dir: PathBuf,
    pub transaction_dir: PathBuf,
    pub runtime_socket: PathBuf,
    pub control_socket: PathBuf,
    pub resources_dir: PathBuf,
}

impl ProxyPaths {
    /// `<state_dir>/global`: the persisted server-state blob.
    pub fn server_state_file(&self) -> PathBuf {
        self.state_dir.join(SERVER_STATE_FILE)
    }

    /// `<state_dir>/status`: published ingress status documents.
    pub fn status_dir(&self) -> PathBuf {
        self.state_dir.join("status")
    }

    /// Directories that must exist before the first reconciliation cycle.
    pub fn managed_dirs(&self) -> [&Path; 4] {
        [
            &self.cert_dir,
            &self.map_dir,
            &self.state_dir,
            &self.transaction_dir,
        ]
    }
}

/// Immutable controller configuration, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub paths: ProxyPaths,
    pub proxy_binary: String,
    pub validate_command: Option<Vec<String>>,
    pub publish_service: Option<PublishService>,
    pub watch_namespaces: Vec<String>,
    pub default_backend: Option<ServiceRef>,
    pub default_certificate: Option<String>,
    pub event_buffer: usize,
    /// `None` when periodic resync is disabled.
    pub resync_interval: Option<Duration>,
    pub dry_run: bool,
}

impl ControllerConfig {
    /// Load and resolve in one step.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        ConfigFile::load(path)?.resolve()
    }

    /// Startup check: the proxy's base configuration must already exist.
    pub fn verify_base_config(&self) -> Result<(), ConfigError> {
        if self.paths.config_file.is_file() {
            Ok(())
        } else {
            Err(ConfigError::MissingBaseConfig {
                path: self.paths.config_file.clone(),
            })
        }
    }

    /// Create the certificate, map, state and transaction directories (mode `0755`).
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in self.paths.managed_dirs() {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
                set_dir_permissions(dir)?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_dir_permissions(dir: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).map_err(|e| io_err(dir, e))
}

#[cfg(not(unix))]
fn set_dir_permissions(_dir: &Path) -> Result<(), ConfigError> {
    Ok(())
}
