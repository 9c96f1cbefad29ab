//! # processor
//!
//! why: the seam business logic plugs into the processing loop through
//! relations: implemented by workflow processors, driven by state_machine.rs
//! what: StreamProcessor, EventProcessor, RecordProcessors dispatch table, built-in processors

use std::collections::HashMap;

use stream_core::{LoggedRecord, RecordType};

use crate::state::StateStore;
use crate::writer::RecordWriter;

/// Turns each record read from the log into an [`EventProcessor`]
pub trait StreamProcessor: Send {
    /// Called once before the first record, after state was recovered
    fn on_recovered(&mut self, _state: &dyn StateStore) {}

    fn on_event(&mut self, record: &LoggedRecord) -> Box<dyn EventProcessor>;
}

/// Processing of a single record
///
/// The loop calls `process_event`, `write_event`, commits, then calls
/// `execute_side_effects`. When any step before the commit fails the state is
/// rolled back and `on_error` supplies the processor that runs instead.
pub trait EventProcessor: Send {
    /// Apply the record to state; runs inside a transaction
    fn process_event(&mut self, state: &mut dyn StateStore) -> anyhow::Result<()>;

    /// Stage the resulting records, e.g. follow-up events or a rejection
    fn write_event(&mut self, writer: &mut RecordWriter) -> anyhow::Result<()>;

    /// Replacement processor after `error`; runs inside a fresh transaction
    ///
    /// The returned processor is not asked to `process_event` again, only to
    /// write and execute side effects.
    fn on_error(
        self: Box<Self>,
        error: &anyhow::Error,
        state: &mut dyn StateStore,
    ) -> anyhow::Result<Box<dyn EventProcessor>>;

    /// Run actions outside the transaction, e.g. sending a response
    ///
    /// `Ok(false)` asks for another attempt. Side effects must be idempotent.
    fn execute_side_effects(&mut self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Builds the event processor for one kind of record
pub trait RecordProcessor: Send {
    fn on_record(&mut self, record: &LoggedRecord) -> Box<dyn EventProcessor>;
}

impl<F> RecordProcessor for F
where
    F: FnMut(&LoggedRecord) -> Box<dyn EventProcessor> + Send,
{
    fn on_record(&mut self, record: &LoggedRecord) -> Box<dyn EventProcessor> {
        self(record)
    }
}

/// Dispatch key: record type, value type and intent
pub type DispatchKey = (RecordType, String, String);

/// Stream processor resolving records through a table built at startup
///
/// Records without a registered handler are consumed without output.
#[derive(Default)]
pub struct RecordProcessors {
    handlers: HashMap<DispatchKey, Box<dyn RecordProcessor>>,
}

impl RecordProcessors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for records of the given kind
    pub fn on(
        mut self,
        record_type: RecordType,
        value_type: &str,
        intent: &str,
        processor: impl RecordProcessor + 'static,
    ) -> Self {
        self.handlers.insert(
            (record_type, value_type.to_string(), intent.to_string()),
            Box::new(processor),
        );
        self
    }

    pub fn handles(&self, record_type: RecordType, value_type: &str, intent: &str) -> bool {
        self.handlers
            .contains_key(&(record_type, value_type.to_string(), intent.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl StreamProcessor for RecordProcessors {
    fn on_event(&mut self, record: &LoggedRecord) -> Box<dyn EventProcessor> {
        let key = (
            record.record.record_type,
            record.record.value_type.clone(),
            record.record.intent.clone(),
        );
        match self.handlers.get_mut(&key) {
            Some(handler) => handler.on_record(record),
            None => Box::new(SkipEventProcessor),
        }
    }
}

impl std::fmt::Debug for RecordProcessors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordProcessors")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Consumes a record without touching state or writing output
#[derive(Debug, Default)]
pub struct SkipEventProcessor;

impl EventProcessor for SkipEventProcessor {
    fn process_event(&mut self, _state: &mut dyn StateStore) -> anyhow::Result<()> {
        Ok(())
    }

    fn write_event(&mut self, _writer: &mut RecordWriter) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(
        self: Box<Self>,
        _error: &anyhow::Error,
        _state: &mut dyn StateStore,
    ) -> anyhow::Result<Box<dyn EventProcessor>> {
        Ok(self)
    }
}

/// Writes the rejection of a command, the usual error path output
#[derive(Debug)]
pub struct RejectionProcessor {
    command: LoggedRecord,
    reason: String,
}

impl RejectionProcessor {
    pub fn new(command: LoggedRecord, reason: impl Into<String>) -> Self {
        Self {
            command,
            reason: reason.into(),
        }
    }

    /// Reject `command` with the message of `error`
    pub fn for_error(command: LoggedRecord, error: &anyhow::Error) -> Self {
        Self::new(command, error.to_string())
    }
}

impl EventProcessor for RejectionProcessor {
    fn process_event(&mut self, _state: &mut dyn StateStore) -> anyhow::Result<()> {
        Ok(())
    }

    fn write_event(&mut self, writer: &mut RecordWriter) -> anyhow::Result<()> {
        writer.append_rejection(&self.command, self.reason.clone())?;
        Ok(())
    }

    fn on_error(
        self: Box<Self>,
        error: &anyhow::Error,
        _state: &mut dyn StateStore,
    ) -> anyhow::Result<Box<dyn EventProcessor>> {
        Err(anyhow::anyhow!(
            "rejection of record {} failed: {error}",
            self.command.position
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stream_core::Record;

    fn logged(record_type: RecordType, intent: &str) -> LoggedRecord {
        let mut record = Record::command(1, "job", intent, json!({}));
        record.record_type = record_type;
        LoggedRecord {
            position: 1,
            record,
        }
    }

    struct Marker(&'static str);

    impl EventProcessor for Marker {
        fn process_event(&mut self, _state: &mut dyn StateStore) -> anyhow::Result<()> {
            anyhow::bail!(self.0)
        }

        fn write_event(&mut self, _writer: &mut RecordWriter) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_error(
            self: Box<Self>,
            _error: &anyhow::Error,
            _state: &mut dyn StateStore,
        ) -> anyhow::Result<Box<dyn EventProcessor>> {
            Ok(self)
        }
    }

    #[test]
    fn dispatch_resolves_by_type_and_intent() {
        let mut processors = RecordProcessors::new().on(
            RecordType::Command,
            "job",
            "complete",
            |_record: &LoggedRecord| -> Box<dyn EventProcessor> { Box::new(Marker("complete")) },
        );
        assert!(processors.handles(RecordType::Command, "job", "complete"));
        assert!(!processors.handles(RecordType::Event, "job", "complete"));

        let mut state = crate::state::MemoryStateStore::new();
        let mut handled = processors.on_event(&logged(RecordType::Command, "complete"));
        let error = handled.process_event(&mut state).unwrap_err();
        assert_eq!(error.to_string(), "complete");
    }

    #[test]
    fn unknown_records_are_skipped() {
        let mut processors = RecordProcessors::new();
        let mut state = crate::state::MemoryStateStore::new();

        let mut skipped = processors.on_event(&logged(RecordType::Event, "created"));
        assert!(skipped.process_event(&mut state).is_ok());
        assert!(skipped.execute_side_effects().unwrap());
    }
}
