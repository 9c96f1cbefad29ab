//! # observability
//!
//! why: keep log wording and structured fields of the processing loop in one place
//! relations: emitted by state_machine.rs and controller.rs
//! what: message structs with Display, the StructuredLog trait, init_logging

use std::fmt::{Display, Formatter};
use std::time::Duration;

use stream_core::Position;

use crate::error::CyclePhase;

/// A log message that knows its level and structured fields
pub trait StructuredLog: Display {
    fn log(&self);
}

/// Install a fmt subscriber filtered by `RUST_LOG`
///
/// Does nothing when a global subscriber is already set, so tests and
/// embedding applications can call it freely.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// State was recovered and the loop resumes reading.
///
/// `info!`
pub struct RecoveryCompleted<'a> {
    pub name: &'a str,
    pub last_processed_position: Option<Position>,
    pub resume_position: Position,
}

impl Display for RecoveryCompleted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self.last_processed_position {
            Some(last) => write!(
                f,
                "{} recovered, last processed position {}, resuming at {}",
                self.name, last, self.resume_position
            ),
            None => write!(f, "{} recovered without progress, reading from the start", self.name),
        }
    }
}

impl StructuredLog for RecoveryCompleted<'_> {
    fn log(&self) {
        tracing::info!(
            processor = self.name,
            last_processed_position = self.last_processed_position,
            resume_position = self.resume_position,
            "{}", self
        );
    }
}

/// A cycle step failed and the record is handed to the error path.
///
/// `warn!` - business failures are expected, but worth seeing
pub struct CycleFailed<'a> {
    pub name: &'a str,
    pub position: Position,
    pub phase: CyclePhase,
    pub error: &'a anyhow::Error,
}

impl Display for CycleFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} failed to {} record {}: {:#}",
            self.name, self.phase, self.position, self.error
        )
    }
}

impl StructuredLog for CycleFailed<'_> {
    fn log(&self) {
        tracing::warn!(
            processor = self.name,
            position = self.position,
            phase = %self.phase,
            "{}", self
        );
    }
}

/// Error output was committed for a record.
///
/// `debug!`
pub struct ErrorPathCompleted<'a> {
    pub name: &'a str,
    pub position: Position,
    pub written_position: Option<Position>,
}

impl Display for ErrorPathCompleted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self.written_position {
            Some(written) => write!(
                f,
                "{} handled failure of record {}, error output up to {}",
                self.name, self.position, written
            ),
            None => write!(
                f,
                "{} handled failure of record {} without output",
                self.name, self.position
            ),
        }
    }
}

impl StructuredLog for ErrorPathCompleted<'_> {
    fn log(&self) {
        tracing::debug!(
            processor = self.name,
            position = self.position,
            written_position = self.written_position,
            "{}", self
        );
    }
}

/// The loop waits for error output to become durable.
///
/// `debug!`
pub struct StalledOnCommit<'a> {
    pub name: &'a str,
    pub error_position: Position,
    pub commit_position: Position,
}

impl Display for StalledOnCommit<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} waits for commit position {} to reach error output at {}",
            self.name, self.commit_position, self.error_position
        )
    }
}

impl StructuredLog for StalledOnCommit<'_> {
    fn log(&self) {
        tracing::debug!(
            processor = self.name,
            error_position = self.error_position,
            commit_position = self.commit_position,
            "{}", self
        );
    }
}

/// Appending output records failed and will be retried.
///
/// `warn!`
pub struct StorageAppendRetry<'a> {
    pub name: &'a str,
    pub position: Position,
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub error: &'a dyn std::error::Error,
}

impl Display for StorageAppendRetry<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} could not append output of record {} (attempt {}/{}), retrying in {:?}: {}",
            self.name, self.position, self.attempt, self.max_attempts, self.backoff, self.error
        )
    }
}

impl StructuredLog for StorageAppendRetry<'_> {
    fn log(&self) {
        tracing::warn!(
            processor = self.name,
            position = self.position,
            attempt = self.attempt,
            max_attempts = self.max_attempts,
            "{}", self
        );
    }
}

/// Side effects of a committed record did not complete.
///
/// `error!` - the record is not retried, the effect may be lost
pub struct SideEffectsFailed<'a> {
    pub name: &'a str,
    pub position: Position,
    pub attempts: u32,
    pub error: Option<&'a anyhow::Error>,
}

impl Display for SideEffectsFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self.error {
            Some(error) => write!(
                f,
                "{} side effects of record {} failed after {} attempts: {:#}",
                self.name, self.position, self.attempts, error
            ),
            None => write!(
                f,
                "{} side effects of record {} still incomplete after {} attempts",
                self.name, self.position, self.attempts
            ),
        }
    }
}

impl StructuredLog for SideEffectsFailed<'_> {
    fn log(&self) {
        tracing::error!(
            processor = self.name,
            position = self.position,
            attempts = self.attempts,
            "{}", self
        );
    }
}

/// Output committed before a restart was appended during recovery.
///
/// `info!`
pub struct PendingOutputAppended<'a> {
    pub name: &'a str,
    pub position: Position,
    pub written_position: Option<Position>,
}

impl Display for PendingOutputAppended<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self.written_position {
            Some(written) => write!(
                f,
                "{} appended pending output of record {} up to {}",
                self.name, self.position, written
            ),
            None => write!(f, "{} found no pending output of record {}", self.name, self.position),
        }
    }
}

impl StructuredLog for PendingOutputAppended<'_> {
    fn log(&self) {
        tracing::info!(
            processor = self.name,
            position = self.position,
            written_position = self.written_position,
            "{}", self
        );
    }
}

/// Appended output could not be marked as appended in the state.
///
/// `warn!` - a restart before the next commit appends it again
pub struct PendingOutputNotCleared<'a> {
    pub name: &'a str,
    pub position: Position,
    pub error: &'a dyn std::error::Error,
}

impl Display for PendingOutputNotCleared<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} could not clear pending output of record {}: {}",
            self.name, self.position, self.error
        )
    }
}

impl StructuredLog for PendingOutputNotCleared<'_> {
    fn log(&self) {
        tracing::warn!(
            processor = self.name,
            position = self.position,
            "{}", self
        );
    }
}

/// The loop left its run method.
///
/// `info!`
pub struct ProcessingStopped<'a> {
    pub name: &'a str,
    pub reason: &'a str,
    pub last_processed_position: Option<Position>,
    pub processed: u64,
}

impl Display for ProcessingStopped<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} stopped ({}) after {} records",
            self.name, self.reason, self.processed
        )
    }
}

impl StructuredLog for ProcessingStopped<'_> {
    fn log(&self) {
        tracing::info!(
            processor = self.name,
            reason = self.reason,
            last_processed_position = self.last_processed_position,
            processed = self.processed,
            "{}", self
        );
    }
}
