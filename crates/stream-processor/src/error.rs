//! Errors raised by the log stream, the state store and the processing loop.

use stream_core::{CodecError, Position};
use stream_storage::StorageError;
use thiserror::Error;

/// Boxed business error carried as the source of a fatal fault.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reading or appending records through a [`crate::LogStream`].
#[derive(Debug, Error)]
pub enum LogStreamError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("malformed block: {0}")]
    Codec(#[from] CodecError),

    #[error("record payload could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cannot append an empty batch")]
    EmptyBatch,
}

/// Failures of the record writer while staging output records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriterError {
    #[error("batch already holds the maximum of {limit} records")]
    BatchFull { limit: usize },

    #[error("a record was staged without a source position to follow up on")]
    MissingSourcePosition,
}

/// Failures of a transactional state store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("no transaction is active")]
    NoActiveTransaction,

    #[error("a transaction is already active")]
    TransactionActive,

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("stored value under '{key}' is malformed: {reason}")]
    Malformed { key: String, reason: String },
}

/// The step of a processing cycle a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Process,
    Write,
    Commit,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Process => write!(f, "process"),
            CyclePhase::Write => write!(f, "write"),
            CyclePhase::Commit => write!(f, "commit"),
        }
    }
}

/// Faults that stop the processing loop of a partition.
///
/// Business errors never show up here; they are turned into error records.
/// What remains is fatal for the current processing attempt and is expected
/// to cause a partition restart and replay.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("reading the log failed: {0}")]
    Read(#[source] LogStreamError),

    #[error("appending output of record {position} failed after {attempts} attempts: {source}")]
    Append {
        position: Position,
        attempts: u32,
        #[source]
        source: LogStreamError,
    },

    #[error("error handling of record {position} failed in {phase} phase: {source}")]
    ErrorPath {
        position: Position,
        phase: CyclePhase,
        #[source]
        source: BoxError,
    },

    #[error("state recovery failed: {0}")]
    Recovery(#[source] StateError),

    #[error("log stream was closed while waiting for records")]
    LogStreamClosed,

    #[error("processing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failures loading a [`crate::ProcessingConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
