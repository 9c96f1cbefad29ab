//! # state
//!
//! why: give processors transactional access to partition state
//! relations: exclusively owned by the processing state machine; any KV engine can implement it
//! what: StateStore trait, MemoryStateStore, JSON helpers, last processed position, pending output

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stream_core::{Position, Record};

use crate::error::StateError;

/// Key the processing loop stores its progress under, inside the same
/// transaction as the state mutations of the record.
pub const LAST_PROCESSED_POSITION_KEY: &str = "__last_processed_position";

/// Key the output of the last committed cycle is kept under until it is in the log
pub const PENDING_OUTPUT_KEY: &str = "__pending_output";

/// Output records committed with the state but not appended to the log yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOutput {
    pub source_position: Position,
    /// written by the error path, so the loop stalls until it is durable
    pub error_path: bool,
    pub records: Vec<Record>,
}

fn decode_json<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StateError> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode_json<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StateError> {
    serde_json::to_vec(value).map_err(|e| StateError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Transactional key-value state of one partition
///
/// Reads observe the writes of the active transaction. Mutations outside a
/// transaction are rejected.
pub trait StateStore: Send {
    fn begin(&mut self) -> Result<(), StateError>;

    fn commit(&mut self) -> Result<(), StateError>;

    /// Discard the active transaction, if any
    fn rollback(&mut self);

    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StateError>;

    fn delete(&mut self, key: &str) -> Result<(), StateError>;

    fn last_processed_position(&self) -> Result<Option<Position>, StateError> {
        match self.get(LAST_PROCESSED_POSITION_KEY) {
            None => Ok(None),
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StateError::Malformed {
                    key: LAST_PROCESSED_POSITION_KEY.to_string(),
                    reason: format!("expected 8 bytes, found {}", bytes.len()),
                })?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
        }
    }

    fn set_last_processed_position(&mut self, position: Position) -> Result<(), StateError> {
        self.put(LAST_PROCESSED_POSITION_KEY, position.to_be_bytes().to_vec())
    }

    fn pending_output(&self) -> Result<Option<PendingOutput>, StateError> {
        self.get(PENDING_OUTPUT_KEY)
            .map(|bytes| decode_json(PENDING_OUTPUT_KEY, &bytes))
            .transpose()
    }

    /// Store or, with `None`, drop the pending output inside the active transaction
    fn set_pending_output(&mut self, output: Option<&PendingOutput>) -> Result<(), StateError> {
        match output {
            Some(output) => self.put(PENDING_OUTPUT_KEY, encode_json(PENDING_OUTPUT_KEY, output)?),
            None => self.delete(PENDING_OUTPUT_KEY),
        }
    }
}

/// Read a JSON value from the store
pub fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StateError> {
    store
        .get(key)
        .map(|bytes| decode_json(key, &bytes))
        .transpose()
}

/// Write a value to the store as JSON
pub fn put_json<T: Serialize>(
    store: &mut dyn StateStore,
    key: &str,
    value: &T,
) -> Result<(), StateError> {
    store.put(key, encode_json(key, value)?)
}

/// In-memory state store
///
/// Pending writes are kept in an overlay that is merged on commit and thrown
/// away on rollback.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    committed: BTreeMap<String, Vec<u8>>,
    /// `None` marks a pending delete
    pending: Option<BTreeMap<String, Option<Vec<u8>>>>,
    failing_commits: usize,
    commits: u64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail
    pub fn fail_next_commits(&mut self, count: usize) {
        self.failing_commits = count;
    }

    pub fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    /// Committed entries, excluding the keys of the processing loop
    pub fn committed_entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.committed
            .iter()
            .filter(|(key, _)| {
                key.as_str() != LAST_PROCESSED_POSITION_KEY && key.as_str() != PENDING_OUTPUT_KEY
            })
            .map(|(key, value)| (key.as_str(), value.as_slice()))
    }

    fn pending_mut(&mut self) -> Result<&mut BTreeMap<String, Option<Vec<u8>>>, StateError> {
        self.pending.as_mut().ok_or(StateError::NoActiveTransaction)
    }
}

impl StateStore for MemoryStateStore {
    fn begin(&mut self) -> Result<(), StateError> {
        if self.pending.is_some() {
            return Err(StateError::TransactionActive);
        }
        self.pending = Some(BTreeMap::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StateError> {
        if self.pending.is_none() {
            return Err(StateError::NoActiveTransaction);
        }
        if self.failing_commits > 0 {
            self.failing_commits -= 1;
            return Err(StateError::CommitFailed("injected commit failure".to_string()));
        }

        for (key, value) in self.pending.take().unwrap_or_default() {
            match value {
                Some(value) => {
                    self.committed.insert(key, value);
                }
                None => {
                    self.committed.remove(&key);
                }
            }
        }
        self.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) {
        self.pending = None;
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(pending) = &self.pending {
            if let Some(value) = pending.get(key) {
                return value.clone();
            }
        }
        self.committed.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StateError> {
        self.pending_mut()?.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StateError> {
        self.pending_mut()?.insert(key.to_string(), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_visible_inside_transaction_and_after_commit() {
        let mut store = MemoryStateStore::new();
        store.begin().unwrap();
        store.put("a", b"1".to_vec()).unwrap();
        assert_eq!(store.get("a"), Some(b"1".to_vec()));

        store.commit().unwrap();
        assert_eq!(store.get("a"), Some(b"1".to_vec()));
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn rollback_discards_pending_writes() {
        let mut store = MemoryStateStore::new();
        store.begin().unwrap();
        store.put("a", b"1".to_vec()).unwrap();
        store.rollback();

        assert_eq!(store.get("a"), None);
        assert!(!store.in_transaction());
    }

    #[test]
    fn delete_is_applied_on_commit() {
        let mut store = MemoryStateStore::new();
        store.begin().unwrap();
        store.put("a", b"1".to_vec()).unwrap();
        store.commit().unwrap();

        store.begin().unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.get("a"), None);
        store.rollback();
        assert_eq!(store.get("a"), Some(b"1".to_vec()));
    }

    #[test]
    fn mutation_without_transaction_is_rejected() {
        let mut store = MemoryStateStore::new();
        assert_eq!(store.put("a", vec![]), Err(StateError::NoActiveTransaction));
        assert_eq!(store.commit(), Err(StateError::NoActiveTransaction));
    }

    #[test]
    fn failed_commit_keeps_transaction_open() {
        let mut store = MemoryStateStore::new();
        store.fail_next_commits(1);
        store.begin().unwrap();
        store.put("a", b"1".to_vec()).unwrap();

        assert!(matches!(store.commit(), Err(StateError::CommitFailed(_))));
        assert!(store.in_transaction());
        store.rollback();
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn last_processed_position_round_trips_through_transaction() {
        let mut store = MemoryStateStore::new();
        assert_eq!(store.last_processed_position().unwrap(), None);

        store.begin().unwrap();
        store.set_last_processed_position(42).unwrap();
        store.commit().unwrap();

        assert_eq!(store.last_processed_position().unwrap(), Some(42));
        assert_eq!(store.committed_entries().count(), 0);
    }

    #[test]
    fn pending_output_commits_and_clears_in_transactions() {
        let mut store = MemoryStateStore::new();
        let output = PendingOutput {
            source_position: 3,
            error_path: false,
            records: vec![Record::event(7, "job", "created", serde_json::json!({}))],
        };

        store.begin().unwrap();
        store.set_last_processed_position(3).unwrap();
        store.set_pending_output(Some(&output)).unwrap();
        store.commit().unwrap();
        assert_eq!(store.pending_output().unwrap(), Some(output));
        assert_eq!(store.committed_entries().count(), 0);

        store.begin().unwrap();
        store.set_pending_output(None).unwrap();
        store.commit().unwrap();
        assert_eq!(store.pending_output().unwrap(), None);
    }

    #[test]
    fn json_helpers_store_typed_values() {
        let mut store = MemoryStateStore::new();
        store.begin().unwrap();
        put_json(&mut store, "job-1", &vec![1, 2, 3]).unwrap();
        store.commit().unwrap();

        let value: Option<Vec<u32>> = get_json(&store, "job-1").unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
        let missing: Option<Vec<u32>> = get_json(&store, "job-2").unwrap();
        assert_eq!(missing, None);
    }
}
