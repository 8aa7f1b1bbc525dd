//! Error taxonomy for the migration tool.
//!
//! Only [`ConfigError`] and [`InitError`] are fatal to the process. Per-object errors
//! ([`TransferError`], [`VerificationError`]) are caught at the object boundary and
//! recorded in the ledger; [`ListError`] aborts the batch for one source only.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::models::{ObjectKey, TransferState};

/// Bad or missing settings. Aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("source '{0}' is not configured")]
    UnknownSource(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// A storage client could not be constructed.
#[derive(Debug, Error)]
#[error("failed to initialise backend '{backend}': {reason}")]
pub struct BackendInitError {
    pub backend: String,
    pub reason: String,
}

impl BackendInitError {
    pub fn new(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            reason: reason.into(),
        }
    }
}

/// Enumerating a source failed.
#[derive(Debug, Clone, Error)]
#[error("failed to list objects in '{source_name}': {message}")]
pub struct ListError {
    pub source_name: String,
    pub message: String,
}

impl ListError {
    pub fn new(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// Classification of a failed fetch/put/stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferErrorKind {
    Network,
    NotFound,
    Permission,
    /// The local staging disk failed, or the key cannot be staged safely.
    LocalIo,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network error",
            Self::NotFound => "not found",
            Self::Permission => "permission denied",
            Self::LocalIo => "local I/O error",
        };
        f.write_str(label)
    }
}

/// A single object transfer step failed.
#[derive(Debug, Clone, Error)]
#[error("{kind} for '{key}': {message}")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub key: ObjectKey,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, key: &ObjectKey, message: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.clone(),
            message: message.into(),
        }
    }

    /// Map a local filesystem error, keeping `NotFound`/`PermissionDenied` distinct.
    pub fn local(key: &ObjectKey, err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => TransferErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => TransferErrorKind::Permission,
            _ => TransferErrorKind::LocalIo,
        };
        Self::new(kind, key, err.to_string())
    }
}

/// Post-upload verification failed.
#[derive(Debug, Clone, Error)]
pub enum VerificationError {
    #[error("size mismatch: staged copy is {expected} bytes, destination reports {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("could not stat destination object: {0}")]
    Stat(#[from] TransferError),
}

/// Ledger transition or persistence failure.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The orchestrator asked for a transition the state machine does not allow.
    #[error("invalid transition for '{key}': cannot {action} from {from}")]
    InvalidTransition {
        key: ObjectKey,
        from: TransferState,
        action: &'static str,
    },

    #[error("ledger I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A batch could not run to completion.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    List(#[from] ListError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Startup failure: configuration, backend construction, or an unreadable ledger.
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendInitError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
