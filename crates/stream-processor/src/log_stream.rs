//! # log_stream
//!
//! why: turn a block storage into an ordered stream of positioned records
//! relations: wraps a stream-storage LogStorage; read by the state machine, appended by writer.rs
//! what: LogStream (position assignment, written/commit watermarks), LogStreamReader

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use stream_core::{decode_block, encode_block, JournalEntry, LoggedRecord, Position, Record};
use stream_storage::{Address, AppendListener, LogStorage, LogStorageReader, MIN_POSITION};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::LogStreamError;

/// Moves a watermark forward, never backwards
fn advance(watermark: &watch::Sender<Position>, position: Position) {
    watermark.send_if_modified(|current| {
        if position > *current {
            *current = position;
            true
        } else {
            false
        }
    });
}

/// Forwards storage acknowledgments into the stream's watermarks
struct WatermarkListener {
    written: Arc<watch::Sender<Position>>,
    committed: Arc<watch::Sender<Position>>,
}

impl AppendListener for WatermarkListener {
    fn on_write(&mut self, _address: Address, highest_position: Position) {
        advance(&self.written, highest_position);
    }

    fn on_commit(&mut self, _address: Address, highest_position: Position) {
        advance(&self.committed, highest_position);
    }
}

/// The record log of one partition
///
/// Positions are assigned at append time, starting at 1, and each append
/// becomes one storage block. Appends are serialized by the stream.
pub struct LogStream {
    partition_id: u32,
    storage: Arc<dyn LogStorage>,
    /// highest position handed out so far
    last_position: Mutex<Position>,
    written: Arc<watch::Sender<Position>>,
    committed: Arc<watch::Sender<Position>>,
}

impl LogStream {
    /// Open the storage and continue after the records it already holds
    ///
    /// Records found at open time are treated as committed.
    pub fn open(
        partition_id: u32,
        storage: Arc<dyn LogStorage>,
    ) -> Result<Arc<Self>, LogStreamError> {
        storage.open()?;

        let mut reader = storage.new_reader();
        let last_position = match reader.read_last_block()? {
            Some(block) => block.highest_position,
            None => MIN_POSITION,
        };

        info!(partition_id, last_position, "opened log stream");
        let (written, _) = watch::channel(last_position);
        let (committed, _) = watch::channel(last_position);
        Ok(Arc::new(Self {
            partition_id,
            storage,
            last_position: Mutex::new(last_position),
            written: Arc::new(written),
            committed: Arc::new(committed),
        }))
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Append records as one block and return the position of the last one
    pub fn append(&self, records: &[Record]) -> Result<Position, LogStreamError> {
        if records.is_empty() {
            return Err(LogStreamError::EmptyBatch);
        }

        let mut last_position = self
            .last_position
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let lowest = *last_position + 1;

        let mut entries = Vec::with_capacity(records.len());
        for (offset, record) in records.iter().enumerate() {
            entries.push(JournalEntry::new(lowest + offset as u64, record.to_payload()?));
        }
        let highest = lowest + records.len() as u64 - 1;
        let block = encode_block(&entries)?;

        let listener = WatermarkListener {
            written: Arc::clone(&self.written),
            committed: Arc::clone(&self.committed),
        };
        self.storage
            .append(lowest, highest, &block, Box::new(listener))?;
        *last_position = highest;

        debug!(
            partition_id = self.partition_id,
            lowest,
            highest,
            bytes = block.len(),
            "appended block"
        );
        Ok(highest)
    }

    /// Highest position the storage acknowledged as written
    pub fn written_position(&self) -> Position {
        *self.written.borrow()
    }

    /// Highest position known to be durable; the authoritative boundary
    pub fn commit_position(&self) -> Position {
        *self.committed.borrow()
    }

    /// Notified whenever new records become readable
    pub fn subscribe_written(&self) -> watch::Receiver<Position> {
        self.written.subscribe()
    }

    /// Notified whenever the commit position advances
    pub fn subscribe_commit(&self) -> watch::Receiver<Position> {
        self.committed.subscribe()
    }

    pub fn new_reader(&self) -> LogStreamReader {
        LogStreamReader::new(self.storage.new_reader())
    }

    /// Force buffered data of the storage out
    pub fn flush(&self) -> Result<(), LogStreamError> {
        Ok(self.storage.flush()?)
    }

    pub fn close(&self) {
        self.storage.close();
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("partition_id", &self.partition_id)
            .field("written_position", &self.written_position())
            .field("commit_position", &self.commit_position())
            .finish()
    }
}

/// Single-owner cursor over the records of a log stream
pub struct LogStreamReader {
    reader: Box<dyn LogStorageReader>,
    /// next block to read, resolved lazily from `next_position`
    next_address: Option<Address>,
    next_position: Position,
    buffered: VecDeque<LoggedRecord>,
}

impl LogStreamReader {
    fn new(reader: Box<dyn LogStorageReader>) -> Self {
        Self {
            reader,
            next_address: None,
            next_position: MIN_POSITION,
            buffered: VecDeque::new(),
        }
    }

    /// Continue reading at the first record with a position >= `position`
    pub fn seek(&mut self, position: Position) {
        self.next_position = position;
        self.next_address = None;
        self.buffered.clear();
    }

    /// Position the next returned record will at least have
    pub fn next_position(&self) -> Position {
        self.next_position
    }

    /// Next record, or `None` if the reader caught up with the log
    pub fn next(&mut self) -> Result<Option<LoggedRecord>, LogStreamError> {
        loop {
            while let Some(record) = self.buffered.pop_front() {
                if record.position >= self.next_position {
                    self.next_position = record.position + 1;
                    return Ok(Some(record));
                }
            }

            let address = match self.next_address {
                Some(address) => address,
                None => match self.reader.lookup_approximate_address(self.next_position) {
                    Some(address) => address,
                    None => return Ok(None),
                },
            };

            let block = match self.reader.read(address)? {
                Some(block) => block,
                None => {
                    self.next_address = Some(address);
                    return Ok(None);
                }
            };

            for entry in decode_block(&block.data)? {
                self.buffered.push_back(LoggedRecord::from_entry(&entry)?);
            }
            self.next_address = Some(block.next_address());
        }
    }
}
