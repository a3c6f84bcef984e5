//! Error types for ingress-sync.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::TransactionId;

/// Errors raised by the transaction layer, the translation passes and the
/// status publisher.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Status document serialization error.
    #[error("status JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transaction {id} is still open")]
    TransactionActive { id: TransactionId },

    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("unknown transaction {id}")]
    UnknownTransaction { id: TransactionId },

    /// The validation command rejected the rendered configuration.
    #[error("configuration {path} failed validation ({status}): {stderr}")]
    Validation {
        path: PathBuf,
        status: String,
        stderr: String,
    },

    /// The validation command could not be started at all.
    #[error("failed to run validation command `{program}`: {source}")]
    ValidationSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("secret {key} not found")]
    MissingSecret { key: String },

    #[error("secret {key} has no tls.crt/tls.key pair")]
    IncompleteSecret { key: String },

    #[error("invalid value {value:?} for {name}")]
    InvalidSetting { name: String, value: String },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
