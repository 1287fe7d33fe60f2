//! Error types for bring-up, storage, the reaper, the request server and
//! the lifecycle controller.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::state::Phase;

/// Configuration could not be read or is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal errors raised while bringing the service up. None of these are retried.
#[derive(Debug, Error)]
pub enum BringUpError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database descriptor [database] is not set in the configuration")]
    MissingDatabase,

    #[error("failed to create upload directory {path}: {source}")]
    UploadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open paste database: {0}")]
    Database(#[source] StoreError),
}

/// Errors from the record collection or the upload directory.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt database file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid resource identifier {0:?}")]
    InvalidId(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Misuse of the background reaper's start/stop protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReaperError {
    #[error("reaper was already started")]
    AlreadyStarted,

    #[error("reap interval must be greater than zero")]
    ZeroInterval,
}

/// Transport failures of the request server.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid bind address {addr:?}: {reason}")]
    Address { addr: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("serving task terminated abnormally: {0}")]
    Task(String),
}

/// Errors surfaced by the lifecycle controller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("operation {operation} is not allowed in phase {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },

    #[error(transparent)]
    BringUp(#[from] BringUpError),

    #[error(transparent)]
    Reaper(#[from] ReaperError),
}
