//! Error types for ingress-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while loading or preparing controller configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse controller config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The proxy's base configuration file is absent; the controller cannot start.
    #[error("proxy base configuration not found at {path}")]
    MissingBaseConfig { path: PathBuf },

    /// A configuration value is present but unusable.
    #[error("invalid controller config: {0}")]
    Invalid(String),
}

/// Convenience constructor for [`ConfigError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
