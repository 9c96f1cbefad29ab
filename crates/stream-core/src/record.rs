//! # record
//!
//! why: define the generic record every processor reads from and writes to the log
//! relations: serialized into JournalEntry payloads, dispatched by stream-processor
//! what: RecordType, Record, LoggedRecord, payload (de)serialization

use serde::{Deserialize, Serialize};

use crate::journal::{JournalEntry, Position};

/// Category of a record in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// A request to change state, written by clients or processors
    Command,
    /// The accepted effect of a command
    Event,
    /// A command that was not applied, carries a reason
    CommandRejection,
}

/// A single logical command/event unit
///
/// The value is kept as JSON so the core stays independent of the concrete
/// workflow record types that business processors define.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Key of the entity the record is about
    pub key: u64,
    pub record_type: RecordType,
    /// Kind of entity, e.g. "job" or "workflow_instance"
    pub value_type: String,
    /// What happened or is requested, e.g. "create" or "created"
    pub intent: String,
    pub value: serde_json::Value,
    /// Position of the record that caused this one, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Record {
    /// Create a new command record
    pub fn command(
        key: u64,
        value_type: impl Into<String>,
        intent: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            key,
            record_type: RecordType::Command,
            value_type: value_type.into(),
            intent: intent.into(),
            value,
            source_position: None,
            rejection_reason: None,
        }
    }

    /// Create a new event record
    pub fn event(
        key: u64,
        value_type: impl Into<String>,
        intent: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            record_type: RecordType::Event,
            ..Self::command(key, value_type, intent, value)
        }
    }

    /// Create the rejection of `command` with a reason
    pub fn rejection(command: &Record, reason: impl Into<String>) -> Self {
        Self {
            key: command.key,
            record_type: RecordType::CommandRejection,
            value_type: command.value_type.clone(),
            intent: command.intent.clone(),
            value: command.value.clone(),
            source_position: None,
            rejection_reason: Some(reason.into()),
        }
    }

    pub fn with_source_position(mut self, source_position: Position) -> Self {
        self.source_position = Some(source_position);
        self
    }

    pub fn is_command(&self) -> bool {
        self.record_type == RecordType::Command
    }

    pub fn is_rejection(&self) -> bool {
        self.record_type == RecordType::CommandRejection
    }

    /// Serialize into a journal payload
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// A record together with the log position it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRecord {
    pub position: Position,
    pub record: Record,
}

impl LoggedRecord {
    /// Decode a journal entry into a logged record
    pub fn from_entry(entry: &JournalEntry) -> Result<Self, serde_json::Error> {
        Ok(Self {
            position: entry.index(),
            record: Record::from_payload(entry.payload())?,
        })
    }
}
