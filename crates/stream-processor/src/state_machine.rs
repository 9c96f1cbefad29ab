//! # state_machine
//!
//! why: drive records of one partition through process, write, commit and side effects
//! relations: reads via log_stream.rs, stages via writer.rs, mutates state.rs, calls processor.rs
//! what: ProcessingStateMachine with recovery, the error path, the commit stall, run loop and step API
//!
//! One cycle per record:
//!
//! ```text
//! READ -> PROCESS -> WRITE -> COMMIT (+ flush output) -> SIDE_EFFECTS -> READ
//!            \          \         \
//!             +----------+---------+--> ON_ERROR -> WRITE -> COMMIT -> ...
//! ```
//!
//! Output records are staged while the transaction is open and appended only
//! once it committed, so a record ends up with either its normal or its error
//! output, never both. The staged batch is committed along with the state as
//! pending output and cleared once appended; recovery appends a batch that is
//! still pending before reading on.

use std::sync::Arc;

use serde::Serialize;
use stream_core::{LoggedRecord, Position, MIN_POSITION};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::ProcessingConfig;
use crate::error::{BoxError, CyclePhase, ProcessingError, StateError};
use crate::log_stream::{LogStream, LogStreamReader};
use crate::observability::{
    CycleFailed, ErrorPathCompleted, PendingOutputAppended, PendingOutputNotCleared,
    ProcessingStopped, RecoveryCompleted, SideEffectsFailed, StalledOnCommit, StorageAppendRetry,
    StructuredLog,
};
use crate::processor::{EventProcessor, StreamProcessor};
use crate::state::{PendingOutput, StateStore};
use crate::writer::RecordWriter;

type Predicate = Box<dyn Fn() -> bool + Send>;

/// Which path committed the output of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CyclePath {
    Normal,
    Error,
}

/// Result of processing one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub position: Position,
    pub path: CyclePath,
    /// Position of the last output record, `None` if nothing was written
    pub written_position: Option<Position>,
    pub side_effects_completed: bool,
}

/// What a single step of the machine did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingStep {
    Processed(CycleOutcome),
    /// The reader caught up with the log
    Idle,
    /// Error output is not durable yet; no record is read until it is
    Stalled {
        error_position: Position,
        commit_position: Position,
    },
}

/// Why [`ProcessingStateMachine::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The abort condition held before a cycle
    Aborted,
    /// The shutdown token was cancelled
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Aborted => "aborted",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// Counters of one machine since it was created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingMetrics {
    pub processed: u64,
    pub error_path: u64,
    pub side_effect_failures: u64,
    pub storage_retries: u64,
    pub last_processed_position: Option<Position>,
}

/// Sequential processing loop of one partition
///
/// Owns the reader, the writer and the state store exclusively. Never run two
/// machines on the same state at once.
pub struct ProcessingStateMachine<S: StateStore> {
    config: ProcessingConfig,
    log_stream: Arc<LogStream>,
    reader: LogStreamReader,
    writer: RecordWriter,
    processor: Box<dyn StreamProcessor>,
    state: S,
    abort_condition: Predicate,
    should_process_next: Predicate,
    shutdown: CancellationToken,
    written: watch::Receiver<Position>,
    committed: watch::Receiver<Position>,
    pending_error_position: Option<Position>,
    /// committed output found by recovery that is not in the log yet
    unflushed: Option<PendingOutput>,
    metrics: ProcessingMetrics,
    recovered: bool,
}

impl<S: StateStore> ProcessingStateMachine<S> {
    pub fn new(
        config: ProcessingConfig,
        log_stream: Arc<LogStream>,
        processor: Box<dyn StreamProcessor>,
        state: S,
    ) -> Self {
        let reader = log_stream.new_reader();
        let writer = RecordWriter::new(Arc::clone(&log_stream), config.max_batch_records);
        let written = log_stream.subscribe_written();
        let committed = log_stream.subscribe_commit();
        Self {
            config,
            log_stream,
            reader,
            writer,
            processor,
            state,
            abort_condition: Box::new(|| false),
            should_process_next: Box::new(|| true),
            shutdown: CancellationToken::new(),
            written,
            committed,
            pending_error_position: None,
            unflushed: None,
            metrics: ProcessingMetrics::default(),
            recovered: false,
        }
    }

    /// Stop before the next cycle once `condition` holds, e.g. on lost leadership
    ///
    /// An idle loop re-checks it every `pause_recheck_ms`.
    pub fn with_abort_condition(mut self, condition: impl Fn() -> bool + Send + 'static) -> Self {
        self.abort_condition = Box::new(condition);
        self
    }

    /// Pause after a cycle while `condition` is false
    pub fn with_should_process_next(
        mut self,
        condition: impl Fn() -> bool + Send + 'static,
    ) -> Self {
        self.should_process_next = Box::new(condition);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn metrics(&self) -> &ProcessingMetrics {
        &self.metrics
    }

    pub fn log_stream(&self) -> &Arc<LogStream> {
        &self.log_stream
    }

    pub fn last_processed_position(&self) -> Option<Position> {
        self.metrics.last_processed_position
    }

    /// Position of uncommitted error output the machine waits for
    pub fn pending_error_position(&self) -> Option<Position> {
        self.pending_error_position
    }

    pub fn into_state(self) -> S {
        self.state
    }

    /// Resume after the last processed position stored in the state
    ///
    /// Called implicitly by the first step, and again by the step after an
    /// append fault. Output that was committed but never appended is appended
    /// by the next step before any record is read. Returns the recovered
    /// position.
    pub fn recover(&mut self) -> Result<Option<Position>, ProcessingError> {
        self.state.rollback();
        let last = self
            .state
            .last_processed_position()
            .map_err(ProcessingError::Recovery)?;
        let resume_position = last.map_or(MIN_POSITION, |position| position + 1);

        self.reader.seek(resume_position);
        self.writer.reset(None);
        self.pending_error_position = None;
        self.unflushed = self
            .state
            .pending_output()
            .map_err(ProcessingError::Recovery)?;
        self.metrics.last_processed_position = last;
        self.processor.on_recovered(&self.state);
        self.recovered = true;

        RecoveryCompleted {
            name: &self.config.name,
            last_processed_position: last,
            resume_position,
        }
        .log();
        Ok(last)
    }

    /// Process the next record if one is readable
    ///
    /// Does not wait for new records: returns [`ProcessingStep::Idle`] when the
    /// log has none and [`ProcessingStep::Stalled`] while error output is not
    /// committed yet.
    pub async fn process_next(&mut self) -> Result<ProcessingStep, ProcessingError> {
        if !self.recovered {
            self.recover()?;
        }
        if let Some(output) = self.unflushed.take() {
            self.append_pending_output(output).await?;
        }

        if let Some(error_position) = self.pending_error_position {
            let commit_position = self.log_stream.commit_position();
            if commit_position < error_position {
                return Ok(ProcessingStep::Stalled {
                    error_position,
                    commit_position,
                });
            }
            self.pending_error_position = None;
        }

        // mark the current watermark as seen before reading, so an append
        // racing with the read still wakes the idle wait
        let _ = self.written.borrow_and_update();
        let record = match self.reader.next().map_err(ProcessingError::Read)? {
            Some(record) => record,
            None => return Ok(ProcessingStep::Idle),
        };

        let outcome = self.process_record(record).await?;
        Ok(ProcessingStep::Processed(outcome))
    }

    /// Process records until aborted or cancelled
    ///
    /// Returns an error for faults that need a partition restart: storage
    /// failures and failures of the error path itself.
    pub async fn run(&mut self) -> Result<StopReason, ProcessingError> {
        let result = self.run_loop().await;
        ProcessingStopped {
            name: &self.config.name,
            reason: match &result {
                Ok(reason) => reason.as_str(),
                Err(_) => "fault",
            },
            last_processed_position: self.metrics.last_processed_position,
            processed: self.metrics.processed,
        }
        .log();
        result
    }

    async fn run_loop(&mut self) -> Result<StopReason, ProcessingError> {
        loop {
            if let Some(reason) = self.stop_requested() {
                return Ok(reason);
            }

            let stopped = match self.process_next().await? {
                ProcessingStep::Processed(_) => self.wait_until_resumed().await?,
                ProcessingStep::Idle => self.wait_for_records().await?,
                ProcessingStep::Stalled {
                    error_position,
                    commit_position,
                } => {
                    StalledOnCommit {
                        name: &self.config.name,
                        error_position,
                        commit_position,
                    }
                    .log();
                    self.wait_for_commit(error_position).await?
                }
            };
            if let Some(reason) = stopped {
                return Ok(reason);
            }
        }
    }

    fn stop_requested(&self) -> Option<StopReason> {
        if self.shutdown.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if (self.abort_condition)() {
            Some(StopReason::Aborted)
        } else {
            None
        }
    }

    /// Suspend until a new record is appended or the abort condition is due a re-check
    async fn wait_for_records(&mut self) -> Result<Option<StopReason>, ProcessingError> {
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => Ok(Some(StopReason::Cancelled)),
            changed = self.written.changed() => {
                changed.map_err(|_| ProcessingError::LogStreamClosed)?;
                Ok(None)
            }
            _ = tokio::time::sleep(self.config.pause_recheck()) => Ok(None),
        }
    }

    /// Suspend until the commit watermark reaches `error_position`
    async fn wait_for_commit(
        &mut self,
        error_position: Position,
    ) -> Result<Option<StopReason>, ProcessingError> {
        let shutdown = self.shutdown.clone();
        loop {
            if *self.committed.borrow_and_update() >= error_position {
                self.pending_error_position = None;
                return Ok(None);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(Some(StopReason::Cancelled)),
                changed = self.committed.changed() => {
                    changed.map_err(|_| ProcessingError::LogStreamClosed)?;
                }
            }
        }
    }

    /// Hold after a cycle while `should_process_next` is false
    ///
    /// Re-checks whenever new records arrive and every `pause_recheck_ms`.
    async fn wait_until_resumed(&mut self) -> Result<Option<StopReason>, ProcessingError> {
        let shutdown = self.shutdown.clone();
        loop {
            if (self.should_process_next)() {
                return Ok(None);
            }
            if let Some(reason) = self.stop_requested() {
                return Ok(Some(reason));
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(Some(StopReason::Cancelled)),
                changed = self.written.changed() => {
                    changed.map_err(|_| ProcessingError::LogStreamClosed)?;
                }
                _ = tokio::time::sleep(self.config.pause_recheck()) => {}
            }
        }
    }

    async fn process_record(
        &mut self,
        record: LoggedRecord,
    ) -> Result<CycleOutcome, ProcessingError> {
        let position = record.position;
        trace!(processor = %self.config.name, position, "processing record");

        self.writer.reset(Some(position));
        let mut event_processor = self.processor.on_event(&record);

        let path = match self.run_normal_path(&mut *event_processor, position) {
            Ok(()) => CyclePath::Normal,
            Err((phase, error)) => {
                CycleFailed {
                    name: &self.config.name,
                    position,
                    phase,
                    error: &error,
                }
                .log();
                event_processor = self.run_error_path(event_processor, position, &error)?;
                CyclePath::Error
            }
        };

        let written_position = self.flush_output(position).await?;
        if written_position.is_some() {
            self.clear_pending_output(position);
        }
        self.metrics.processed += 1;
        self.metrics.last_processed_position = Some(position);

        if path == CyclePath::Error {
            self.metrics.error_path += 1;
            self.await_error_output(written_position);
            ErrorPathCompleted {
                name: &self.config.name,
                position,
                written_position,
            }
            .log();
        }

        let side_effects_completed = self
            .execute_side_effects(&mut *event_processor, position)
            .await;

        Ok(CycleOutcome {
            position,
            path,
            written_position,
            side_effects_completed,
        })
    }

    /// Process, write and commit; the transaction is left open on failure
    fn run_normal_path(
        &mut self,
        event_processor: &mut dyn EventProcessor,
        position: Position,
    ) -> Result<(), (CyclePhase, anyhow::Error)> {
        self.state
            .begin()
            .map_err(|e| (CyclePhase::Process, anyhow::Error::from(e)))?;
        event_processor
            .process_event(&mut self.state)
            .map_err(|e| (CyclePhase::Process, e))?;
        event_processor
            .write_event(&mut self.writer)
            .map_err(|e| (CyclePhase::Write, e))?;
        self.commit_progress(position, CyclePath::Normal)
            .map_err(|e| (CyclePhase::Commit, anyhow::Error::from(e)))
    }

    /// Roll back and let the processor produce error output in a new transaction
    ///
    /// A failure here is not handed to `on_error` again; it stops the machine.
    /// The record is not marked processed, so the next step reads it again.
    fn run_error_path(
        &mut self,
        event_processor: Box<dyn EventProcessor>,
        position: Position,
        error: &anyhow::Error,
    ) -> Result<Box<dyn EventProcessor>, ProcessingError> {
        self.state.rollback();
        self.writer.reset(Some(position));

        match self.error_path_steps(event_processor, position, error) {
            Ok(replacement) => Ok(replacement),
            Err((phase, source)) => {
                self.state.rollback();
                self.writer.reset(Some(position));
                self.recovered = false;
                Err(ProcessingError::ErrorPath {
                    position,
                    phase,
                    source,
                })
            }
        }
    }

    fn error_path_steps(
        &mut self,
        event_processor: Box<dyn EventProcessor>,
        position: Position,
        error: &anyhow::Error,
    ) -> Result<Box<dyn EventProcessor>, (CyclePhase, BoxError)> {
        self.state
            .begin()
            .map_err(|e| (CyclePhase::Process, BoxError::from(e)))?;
        let mut replacement = event_processor
            .on_error(error, &mut self.state)
            .map_err(|e| (CyclePhase::Process, BoxError::from(e)))?;
        replacement
            .write_event(&mut self.writer)
            .map_err(|e| (CyclePhase::Write, BoxError::from(e)))?;
        self.commit_progress(position, CyclePath::Error)
            .map_err(|e| (CyclePhase::Commit, BoxError::from(e)))?;
        Ok(replacement)
    }

    /// Commit the record as processed together with its staged output
    fn commit_progress(&mut self, position: Position, path: CyclePath) -> Result<(), StateError> {
        self.state.set_last_processed_position(position)?;
        let output = (!self.writer.is_empty()).then(|| PendingOutput {
            source_position: position,
            error_path: path == CyclePath::Error,
            records: self.writer.staged().to_vec(),
        });
        self.state.set_pending_output(output.as_ref())?;
        self.state.commit()
    }

    /// Mark the output of `position` as appended
    ///
    /// A failure is only logged: the next commit replaces the pending output
    /// anyway, only a restart before it appends the output twice.
    fn clear_pending_output(&mut self, position: Position) {
        let cleared = self
            .state
            .begin()
            .and_then(|()| self.state.set_pending_output(None))
            .and_then(|()| self.state.commit());
        if let Err(error) = cleared {
            self.state.rollback();
            PendingOutputNotCleared {
                name: &self.config.name,
                position,
                error: &error,
            }
            .log();
        }
    }

    /// Stall on error output that is written but not durable yet
    fn await_error_output(&mut self, written_position: Option<Position>) {
        if let Some(written) = written_position {
            if written > self.log_stream.commit_position() {
                self.pending_error_position = Some(written);
            }
        }
    }

    /// Append output that was committed before a restart or an append fault
    async fn append_pending_output(&mut self, output: PendingOutput) -> Result<(), ProcessingError> {
        let position = output.source_position;
        self.writer.restage(position, output.records);
        let written_position = self.flush_output(position).await?;
        if written_position.is_some() {
            self.clear_pending_output(position);
        }
        if output.error_path {
            self.await_error_output(written_position);
        }
        PendingOutputAppended {
            name: &self.config.name,
            position,
            written_position,
        }
        .log();
        Ok(())
    }

    /// Append the staged output, retrying storage failures per policy
    ///
    /// When all attempts fail the output stays pending in the state and the
    /// next step recovers before it reads on.
    async fn flush_output(&mut self, position: Position) -> Result<Option<Position>, ProcessingError> {
        let policy = self.config.storage_retry.clone();
        let mut attempt = 1;
        loop {
            match self.writer.flush() {
                Ok(written) => return Ok(written),
                Err(error) if attempt < policy.max_attempts => {
                    StorageAppendRetry {
                        name: &self.config.name,
                        position,
                        attempt,
                        max_attempts: policy.max_attempts,
                        backoff: policy.backoff(),
                        error: &error,
                    }
                    .log();
                    self.metrics.storage_retries += 1;
                    tokio::time::sleep(policy.backoff()).await;
                    attempt += 1;
                }
                Err(source) => {
                    self.recovered = false;
                    return Err(ProcessingError::Append {
                        position,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Run side effects with a bounded number of attempts; failures are only logged
    async fn execute_side_effects(
        &mut self,
        event_processor: &mut dyn EventProcessor,
        position: Position,
    ) -> bool {
        let max_attempts = self.config.max_side_effect_attempts;
        let mut attempt = 1;
        loop {
            match event_processor.execute_side_effects() {
                Ok(true) => return true,
                Ok(false) if attempt < max_attempts => {
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                Ok(false) => {
                    SideEffectsFailed {
                        name: &self.config.name,
                        position,
                        attempts: attempt,
                        error: None,
                    }
                    .log();
                    break;
                }
                Err(error) => {
                    SideEffectsFailed {
                        name: &self.config.name,
                        position,
                        attempts: attempt,
                        error: Some(&error),
                    }
                    .log();
                    break;
                }
            }
        }
        self.metrics.side_effect_failures += 1;
        false
    }
}

impl<S: StateStore> std::fmt::Debug for ProcessingStateMachine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingStateMachine")
            .field("name", &self.config.name)
            .field("log_stream", &self.log_stream)
            .field("pending_error_position", &self.pending_error_position)
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{RecordProcessors, RejectionProcessor};
    use crate::state::MemoryStateStore;
    use serde_json::json;
    use stream_core::{Record, RecordType};
    use stream_storage::InMemoryLogStorage;

    struct Create {
        record: LoggedRecord,
    }

    impl EventProcessor for Create {
        fn process_event(&mut self, state: &mut dyn StateStore) -> anyhow::Result<()> {
            let key = self.record.record.key.to_string();
            if state.get(&key).is_some() {
                anyhow::bail!("job {key} already exists");
            }
            state.put(&key, b"created".to_vec())?;
            Ok(())
        }

        fn write_event(&mut self, writer: &mut RecordWriter) -> anyhow::Result<()> {
            writer.append_follow_up_event(self.record.record.key, "job", "created", json!({}))?;
            Ok(())
        }

        fn on_error(
            self: Box<Self>,
            error: &anyhow::Error,
            _state: &mut dyn StateStore,
        ) -> anyhow::Result<Box<dyn EventProcessor>> {
            Ok(Box::new(RejectionProcessor::for_error(self.record, error)))
        }
    }

    fn machine() -> ProcessingStateMachine<MemoryStateStore> {
        let log = LogStream::open(1, Arc::new(InMemoryLogStorage::new())).unwrap();
        machine_on(log, MemoryStateStore::new())
    }

    fn machine_on(
        log: Arc<LogStream>,
        state: MemoryStateStore,
    ) -> ProcessingStateMachine<MemoryStateStore> {
        let processors = RecordProcessors::new().on(
            RecordType::Command,
            "job",
            "create",
            |record: &LoggedRecord| -> Box<dyn EventProcessor> {
                Box::new(Create {
                    record: record.clone(),
                })
            },
        );
        let config = ProcessingConfig {
            storage_retry: crate::config::StorageRetryPolicy {
                max_attempts: 3,
                backoff_ms: 0,
            },
            ..ProcessingConfig::default()
        };
        ProcessingStateMachine::new(config, log, Box::new(processors), state)
    }

    #[tokio::test]
    async fn empty_log_is_idle() {
        let mut machine = machine();
        assert_eq!(machine.process_next().await.unwrap(), ProcessingStep::Idle);
        assert_eq!(machine.last_processed_position(), None);
    }

    #[tokio::test]
    async fn command_produces_follow_up_event() {
        let mut machine = machine();
        machine
            .log_stream()
            .append(&[Record::command(7, "job", "create", json!({}))])
            .unwrap();

        let step = machine.process_next().await.unwrap();
        assert_eq!(
            step,
            ProcessingStep::Processed(CycleOutcome {
                position: 1,
                path: CyclePath::Normal,
                written_position: Some(2),
                side_effects_completed: true,
            })
        );
        assert_eq!(machine.state().get("7"), Some(b"created".to_vec()));
        assert_eq!(machine.state().last_processed_position().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn duplicate_command_is_rejected() {
        let mut machine = machine();
        let create = Record::command(7, "job", "create", json!({}));
        machine
            .log_stream()
            .append(&[create.clone(), create])
            .unwrap();

        machine.process_next().await.unwrap();
        let step = machine.process_next().await.unwrap();
        match step {
            ProcessingStep::Processed(outcome) => {
                assert_eq!(outcome.position, 2);
                assert_eq!(outcome.path, CyclePath::Error);
                assert_eq!(outcome.written_position, Some(4));
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(machine.metrics().error_path, 1);
    }

    #[tokio::test]
    async fn output_lost_to_append_fault_is_appended_on_restart() {
        let storage = InMemoryLogStorage::new();
        let log = LogStream::open(1, Arc::new(storage.clone())).unwrap();
        log.append(&[Record::command(7, "job", "create", json!({}))])
            .unwrap();
        let mut machine = machine_on(Arc::clone(&log), MemoryStateStore::new());

        storage.fail_next_appends(3);
        let error = machine.process_next().await.unwrap_err();
        assert!(matches!(
            error,
            ProcessingError::Append {
                position: 1,
                attempts: 3,
                ..
            }
        ));

        let state = machine.into_state();
        assert_eq!(state.last_processed_position().unwrap(), Some(1));
        assert_eq!(state.get("7"), Some(b"created".to_vec()));
        assert_eq!(state.pending_output().unwrap().map(|o| o.source_position), Some(1));
        log.close();

        let log = LogStream::open(1, Arc::new(storage)).unwrap();
        let mut machine = machine_on(Arc::clone(&log), state);
        let step = machine.process_next().await.unwrap();

        // the appended follow-up event is the next record read
        match step {
            ProcessingStep::Processed(outcome) => {
                assert_eq!(outcome.position, 2);
                assert_eq!(outcome.written_position, None);
            }
            other => panic!("unexpected step {other:?}"),
        }
        let mut reader = log.new_reader();
        reader.seek(2);
        let output = reader.next().unwrap().unwrap();
        assert_eq!(output.record.source_position, Some(1));
        assert_eq!(output.record.intent, "created");
        assert_eq!(machine.state().pending_output().unwrap(), None);
    }

    #[tokio::test]
    async fn append_fault_is_recovered_by_the_next_step() {
        let storage = InMemoryLogStorage::new();
        let log = LogStream::open(1, Arc::new(storage.clone())).unwrap();
        log.append(&[Record::command(7, "job", "create", json!({}))])
            .unwrap();
        let mut machine = machine_on(Arc::clone(&log), MemoryStateStore::new());

        storage.fail_next_appends(3);
        assert!(machine.process_next().await.is_err());
        assert_eq!(log.written_position(), 1);

        match machine.process_next().await.unwrap() {
            ProcessingStep::Processed(outcome) => assert_eq!(outcome.position, 2),
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(machine.process_next().await.unwrap(), ProcessingStep::Idle);
        assert_eq!(log.written_position(), 2);
    }

    #[tokio::test]
    async fn failed_error_path_reads_the_record_again() {
        let mut machine = machine();
        let create = Record::command(7, "job", "create", json!({}));
        machine
            .log_stream()
            .append(&[create.clone(), create])
            .unwrap();
        machine.process_next().await.unwrap();

        // the duplicate fails in process, then the rejection fails to commit
        machine.state_mut().fail_next_commits(1);
        assert!(matches!(
            machine.process_next().await,
            Err(ProcessingError::ErrorPath {
                position: 2,
                phase: CyclePhase::Commit,
                ..
            })
        ));
        assert_eq!(machine.state().last_processed_position().unwrap(), Some(1));

        match machine.process_next().await.unwrap() {
            ProcessingStep::Processed(outcome) => {
                assert_eq!(outcome.position, 2);
                assert_eq!(outcome.path, CyclePath::Error);
                assert_eq!(outcome.written_position, Some(4));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }
}
