//! Configuration backends.
//!
//! A backend hands out numbered transactions, each holding an editable copy
//! of the live configuration as a [`ConfigDocument`]. Committing a
//! transaction installs its document as the new live configuration; deleting
//! it throws the edits away.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use ingress_core::ControllerConfig;

use crate::document::ConfigDocument;
use crate::error::{io_err, SyncError};
use crate::writer::{atomic_write, HashStore, WriteResult};

/// Monotonically increasing transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait ConfigBackend: Send {
    fn start_transaction(&mut self) -> Result<TransactionId, SyncError>;

    fn document(&self, id: TransactionId) -> Result<&ConfigDocument, SyncError>;

    fn document_mut(&mut self, id: TransactionId) -> Result<&mut ConfigDocument, SyncError>;

    /// Install the transaction's document. Returns `true` when the live
    /// configuration changed on disk. On error the transaction stays open.
    fn commit_transaction(&mut self, id: TransactionId) -> Result<bool, SyncError>;

    fn delete_transaction(&mut self, id: TransactionId) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// FileBackend
// ---------------------------------------------------------------------------

struct OpenTransaction {
    file: PathBuf,
    document: ConfigDocument,
}

/// Backend over the live configuration file, staging each transaction in
/// `<transaction_dir>/<id>.cfg`.
pub struct FileBackend {
    config_file: PathBuf,
    transaction_dir: PathBuf,
    validate_command: Option<Vec<String>>,
    next_id: u64,
    open: BTreeMap<TransactionId, OpenTransaction>,
    hashes: HashStore,
}

impl FileBackend {
    pub fn new(
        config_file: impl Into<PathBuf>,
        transaction_dir: impl Into<PathBuf>,
        validate_command: Option<Vec<String>>,
    ) -> Self {
        Self {
            config_file: config_file.into(),
            transaction_dir: transaction_dir.into(),
            validate_command,
            next_id: 1,
            open: BTreeMap::new(),
            hashes: HashStore::new(),
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            &config.paths.config_file,
            &config.paths.transaction_dir,
            config.validate_command.clone(),
        )
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    fn transaction_file(&self, id: TransactionId) -> PathBuf {
        self.transaction_dir.join(format!("{id}.cfg"))
    }

    fn validate(&self, file: &Path) -> Result<(), SyncError> {
        let Some(template) = self.validate_command.as_deref() else {
            return Ok(());
        };
        let Some((program, rest)) = template.split_first() else {
            return Ok(());
        };
        let file_arg = file.to_string_lossy();
        let args: Vec<String> = rest.iter().map(|a| a.replace("{file}", &file_arg)).collect();

        tracing::debug!("validating {} with {program}", file.display());
        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(|source| SyncError::ValidationSpawn {
                program: program.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(SyncError::Validation {
            path: file.to_path_buf(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl ConfigBackend for FileBackend {
    fn start_transaction(&mut self) -> Result<TransactionId, SyncError> {
        let live = std::fs::read_to_string(&self.config_file)
            .map_err(|e| io_err(&self.config_file, e))?;

        let id = TransactionId(self.next_id);
        let file = self.transaction_file(id);
        std::fs::create_dir_all(&self.transaction_dir)
            .map_err(|e| io_err(&self.transaction_dir, e))?;
        std::fs::write(&file, &live).map_err(|e| io_err(&file, e))?;
        self.next_id += 1;

        tracing::debug!("transaction {id} opened at {}", file.display());
        self.open.insert(
            id,
            OpenTransaction {
                file,
                document: ConfigDocument::parse(&live),
            },
        );
        Ok(id)
    }

    fn document(&self, id: TransactionId) -> Result<&ConfigDocument, SyncError> {
        self.open
            .get(&id)
            .map(|tx| &tx.document)
            .ok_or(SyncError::UnknownTransaction { id })
    }

    fn document_mut(&mut self, id: TransactionId) -> Result<&mut ConfigDocument, SyncError> {
        self.open
            .get_mut(&id)
            .map(|tx| &mut tx.document)
            .ok_or(SyncError::UnknownTransaction { id })
    }

    fn commit_transaction(&mut self, id: TransactionId) -> Result<bool, SyncError> {
        let tx = self
            .open
            .get(&id)
            .ok_or(SyncError::UnknownTransaction { id })?;
        let rendered = tx.document.render();
        std::fs::write(&tx.file, &rendered).map_err(|e| io_err(&tx.file, e))?;
        self.validate(&tx.file)?;

        let result = atomic_write(&self.config_file, &rendered, &mut self.hashes)?;
        if let Some(tx) = self.open.remove(&id) {
            let _ = std::fs::remove_file(&tx.file);
        }
        tracing::debug!("transaction {id} committed");
        Ok(matches!(result, WriteResult::Written { .. }))
    }

    fn delete_transaction(&mut self, id: TransactionId) -> Result<(), SyncError> {
        let tx = self
            .open
            .remove(&id)
            .ok_or(SyncError::UnknownTransaction { id })?;
        match std::fs::remove_file(&tx.file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&tx.file, e)),
        }
        tracing::debug!("transaction {id} deleted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
