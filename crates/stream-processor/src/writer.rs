//! # writer
//!
//! why: let event processors stage the records they produce during one cycle
//! relations: handed to EventProcessor::write_event; flushed into log_stream.rs after commit
//! what: RecordWriter with typed append helpers for commands, events and rejections

use std::sync::Arc;

use stream_core::{LoggedRecord, Position, Record};

use crate::error::{LogStreamError, WriterError};
use crate::log_stream::LogStream;

/// Stages output records of the record being processed
///
/// Nothing reaches the log until [`RecordWriter::flush`]; the processing loop
/// only flushes after the state transaction committed, so a discarded batch
/// leaves no trace.
pub struct RecordWriter {
    log_stream: Arc<LogStream>,
    staged: Vec<Record>,
    source_position: Option<Position>,
    max_batch_records: usize,
}

impl RecordWriter {
    pub fn new(log_stream: Arc<LogStream>, max_batch_records: usize) -> Self {
        Self {
            log_stream,
            staged: Vec::new(),
            source_position: None,
            max_batch_records,
        }
    }

    /// Drop staged records and follow up on `source_position` from now on
    pub fn reset(&mut self, source_position: Option<Position>) {
        self.staged.clear();
        self.source_position = source_position;
    }

    /// Stage records that were committed earlier but never reached the log
    pub fn restage(&mut self, source_position: Position, records: Vec<Record>) {
        self.staged = records;
        self.source_position = Some(source_position);
    }

    pub fn source_position(&self) -> Option<Position> {
        self.source_position
    }

    /// Stage a record as is
    pub fn append_record(&mut self, record: Record) -> Result<(), WriterError> {
        if self.staged.len() >= self.max_batch_records {
            return Err(WriterError::BatchFull {
                limit: self.max_batch_records,
            });
        }
        self.staged.push(record);
        Ok(())
    }

    /// Stage a command that is not caused by the current record
    pub fn append_new_command(
        &mut self,
        key: u64,
        value_type: &str,
        intent: &str,
        value: serde_json::Value,
    ) -> Result<(), WriterError> {
        self.append_record(Record::command(key, value_type, intent, value))
    }

    /// Stage an event that is not caused by the current record
    pub fn append_new_event(
        &mut self,
        key: u64,
        value_type: &str,
        intent: &str,
        value: serde_json::Value,
    ) -> Result<(), WriterError> {
        self.append_record(Record::event(key, value_type, intent, value))
    }

    /// Stage an event caused by the record being processed
    pub fn append_follow_up_event(
        &mut self,
        key: u64,
        value_type: &str,
        intent: &str,
        value: serde_json::Value,
    ) -> Result<(), WriterError> {
        let source = self
            .source_position
            .ok_or(WriterError::MissingSourcePosition)?;
        self.append_record(Record::event(key, value_type, intent, value).with_source_position(source))
    }

    /// Stage a command caused by the record being processed
    pub fn append_follow_up_command(
        &mut self,
        key: u64,
        value_type: &str,
        intent: &str,
        value: serde_json::Value,
    ) -> Result<(), WriterError> {
        let source = self
            .source_position
            .ok_or(WriterError::MissingSourcePosition)?;
        self.append_record(
            Record::command(key, value_type, intent, value).with_source_position(source),
        )
    }

    /// Stage the rejection of `command` with a reason
    pub fn append_rejection(
        &mut self,
        command: &LoggedRecord,
        reason: impl Into<String>,
    ) -> Result<(), WriterError> {
        self.append_record(
            Record::rejection(&command.record, reason).with_source_position(command.position),
        )
    }

    pub fn staged(&self) -> &[Record] {
        &self.staged
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Append all staged records as one block
    ///
    /// Returns the position of the last written record, `None` if nothing
    /// was staged. Staged records are kept when the append fails so the
    /// flush can be retried.
    pub fn flush(&mut self) -> Result<Option<Position>, LogStreamError> {
        if self.staged.is_empty() {
            return Ok(None);
        }
        let position = self.log_stream.append(&self.staged)?;
        self.staged.clear();
        Ok(Some(position))
    }
}
