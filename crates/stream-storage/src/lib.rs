//! # stream-storage
//!
//! why: provide the durable, append-only block store a partition log lives in
//! relations: blocks are framed by stream-core, consumed by stream-processor's log stream
//! what: LogStorage/LogStorageReader traits, FileLogStorage, InMemoryLogStorage for testing

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

pub use stream_core::{Position, MIN_POSITION};

mod file;
mod index;
mod memory;

pub use file::FileLogStorage;
pub use memory::InMemoryLogStorage;

/// Internal address of a block; the first block lives at address 1
pub type Address = u64;

/// errors surfaced by a log storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is closed")]
    Closed,

    #[error("invalid block range [{lowest}, {highest}]")]
    InvalidRange { lowest: Position, highest: Position },

    #[error("block [{lowest}, ..] overlaps previous block ending at {last_highest}")]
    OverlappingRange {
        lowest: Position,
        last_highest: Position,
    },

    #[error("block of {0} bytes exceeds the frame size limit")]
    BlockTooLarge(usize),

    #[error("committed block at address {address} is unreadable: {reason}")]
    Corrupted { address: Address, reason: String },

    #[error("storage metadata is invalid: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// when an appended block is acknowledged as committed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityPolicy {
    /// commit right after the block is physically written
    #[default]
    Immediate,
    /// commit only once `flush` forced the data out
    OnFlush,
}

/// a block read back from storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub address: Address,
    pub lowest_position: Position,
    pub highest_position: Position,
    pub data: Vec<u8>,
}

impl Block {
    /// address of the block following this one
    pub fn next_address(&self) -> Address {
        self.address + 1
    }

    pub fn contains(&self, position: Position) -> bool {
        self.lowest_position <= position && position <= self.highest_position
    }
}

/// receives the acknowledgments of one append
///
/// `on_write` always fires before `on_commit`. Neither fires for a failed
/// append, whose error is returned by `append` instead.
pub trait AppendListener: Send + Sync {
    /// the block is physically written and readable
    fn on_write(&mut self, address: Address, highest_position: Position);

    /// the block is durable per the storage's durability policy
    fn on_commit(&mut self, address: Address, highest_position: Position);
}

/// listener for callers that only care about the returned address
pub struct NoopAppendListener;

impl AppendListener for NoopAppendListener {
    fn on_write(&mut self, _address: Address, _highest_position: Position) {}

    fn on_commit(&mut self, _address: Address, _highest_position: Position) {}
}

/// trait for an append-only, position addressable block store
///
/// this abstraction allows the same processing code to work with:
/// - a local segment file (native)
/// - in-memory (testing)
/// - a replicated journal (provided by the replication layer)
pub trait LogStorage: Send + Sync {
    /// open the storage, recovering previously persisted blocks; idempotent
    fn open(&self) -> Result<(), StorageError>;

    /// close the storage; idempotent
    fn close(&self);

    fn is_open(&self) -> bool;

    fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// store a block covering `[lowest_position, highest_position]`
    ///
    /// appends are serialized and ranges must not overlap previous blocks.
    fn append(
        &self,
        lowest_position: Position,
        highest_position: Position,
        block: &[u8],
        listener: Box<dyn AppendListener>,
    ) -> Result<Address, StorageError>;

    /// force buffered data out before returning
    fn flush(&self) -> Result<(), StorageError>;

    /// create a reader for a single consumer
    fn new_reader(&self) -> Box<dyn LogStorageReader>;
}

/// single-owner cursor over the blocks of a storage
pub trait LogStorageReader: Send {
    fn is_empty(&self) -> bool;

    /// block at `address`, or `None` past the last written block
    ///
    /// a committed address that cannot be read is reported as corruption,
    /// never as the end of the log.
    fn read(&mut self, address: Address) -> Result<Option<Block>, StorageError>;

    /// the most recently appended block
    fn read_last_block(&mut self) -> Result<Option<Block>, StorageError>;

    /// address to start reading from to find `position`
    ///
    /// `None` when the storage is empty. `MIN_POSITION` maps to the first
    /// block, a contained position to its block, anything else to the last
    /// block starting at or before it (the first block if there is none).
    fn lookup_approximate_address(&self, position: Position) -> Option<Address>;
}

/// check a new block range against the highest stored position
pub(crate) fn validate_range(
    lowest: Position,
    highest: Position,
    last_highest: Option<Position>,
) -> Result<(), StorageError> {
    if lowest > highest {
        return Err(StorageError::InvalidRange { lowest, highest });
    }
    match last_highest {
        Some(last_highest) if lowest <= last_highest => Err(StorageError::OverlappingRange {
            lowest,
            last_highest,
        }),
        _ => Ok(()),
    }
}
