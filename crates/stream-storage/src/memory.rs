//! in-memory storage for testing
//!
//! keeps every block in memory, nothing survives the process. blocks do
//! survive `close`/`open`, which mimics reopening a persisted log.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::index::BlockIndex;
use crate::{
    Address, AppendListener, Block, DurabilityPolicy, LogStorage, LogStorageReader, Position,
    StorageError,
};

type PositionListener = Arc<dyn Fn(Position) + Send + Sync>;

struct PendingCommit {
    address: Address,
    highest_position: Position,
    listener: Box<dyn AppendListener>,
}

#[derive(Default)]
struct MemoryState {
    open: bool,
    policy: DurabilityPolicy,
    index: BlockIndex,
    blocks: Vec<Vec<u8>>,
    pending: Vec<PendingCommit>,
    failing_appends: usize,
    position_listener: Option<PositionListener>,
}

/// in-memory block storage, cheap to clone; clones share the same blocks
#[derive(Clone)]
pub struct InMemoryLogStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl Default for InMemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogStorage {
    /// create an open in-memory storage committing on write
    pub fn new() -> Self {
        Self::with_policy(DurabilityPolicy::Immediate)
    }

    pub fn with_policy(policy: DurabilityPolicy) -> Self {
        let state = MemoryState {
            open: true,
            policy,
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// called with the highest position of every written block
    pub fn set_position_listener(&self, listener: impl Fn(Position) + Send + Sync + 'static) {
        self.write().position_listener = Some(Arc::new(listener));
    }

    /// make the next `count` appends fail with an i/o error
    pub fn fail_next_appends(&self, count: usize) {
        self.write().failing_appends = count;
    }

    /// number of stored blocks
    pub fn block_count(&self) -> usize {
        self.read().index.len()
    }

    /// number of committed blocks
    pub fn committed_count(&self) -> usize {
        self.read().index.committed()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogStorage for InMemoryLogStorage {
    fn open(&self) -> Result<(), StorageError> {
        self.write().open = true;
        Ok(())
    }

    fn close(&self) {
        self.write().open = false;
    }

    fn is_open(&self) -> bool {
        self.read().open
    }

    fn append(
        &self,
        lowest_position: Position,
        highest_position: Position,
        block: &[u8],
        mut listener: Box<dyn AppendListener>,
    ) -> Result<Address, StorageError> {
        let (address, commit_now, position_listener) = {
            let mut state = self.write();
            if !state.open {
                return Err(StorageError::Closed);
            }
            state.index.check(lowest_position, highest_position)?;
            if state.failing_appends > 0 {
                state.failing_appends -= 1;
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected append failure",
                )));
            }

            let address = state.index.push(lowest_position, highest_position);
            state.blocks.push(block.to_vec());
            let commit_now = state.policy == DurabilityPolicy::Immediate;
            if commit_now {
                state.index.commit_up_to(address);
            }
            (address, commit_now, state.position_listener.clone())
        };

        listener.on_write(address, highest_position);
        if let Some(position_listener) = position_listener {
            position_listener(highest_position);
        }

        if commit_now {
            listener.on_commit(address, highest_position);
        } else {
            self.write().pending.push(PendingCommit {
                address,
                highest_position,
                listener,
            });
        }
        Ok(address)
    }

    fn flush(&self) -> Result<(), StorageError> {
        let pending = {
            let mut state = self.write();
            let pending = std::mem::take(&mut state.pending);
            if let Some(last) = pending.last() {
                state.index.commit_up_to(last.address);
            }
            pending
        };

        if !pending.is_empty() {
            debug!(count = pending.len(), "committing flushed blocks");
        }
        for mut commit in pending {
            commit.listener.on_commit(commit.address, commit.highest_position);
        }
        Ok(())
    }

    fn new_reader(&self) -> Box<dyn LogStorageReader> {
        Box::new(InMemoryReader {
            state: Arc::clone(&self.state),
        })
    }
}

struct InMemoryReader {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryReader {
    fn state(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogStorageReader for InMemoryReader {
    fn is_empty(&self) -> bool {
        self.state().index.is_empty()
    }

    fn read(&mut self, address: Address) -> Result<Option<Block>, StorageError> {
        let state = self.state();
        let range = match state.index.range(address) {
            Some(range) => range,
            None if state.index.is_committed(address) => {
                return Err(StorageError::Corrupted {
                    address,
                    reason: "committed block is missing".to_string(),
                })
            }
            None => return Ok(None),
        };

        let data = state.blocks[(address - 1) as usize].clone();
        Ok(Some(Block {
            address,
            lowest_position: range.lowest,
            highest_position: range.highest,
            data,
        }))
    }

    fn read_last_block(&mut self) -> Result<Option<Block>, StorageError> {
        let last = self.state().index.len() as Address;
        if last == 0 {
            return Ok(None);
        }
        self.read(last)
    }

    fn lookup_approximate_address(&self, position: Position) -> Option<Address> {
        self.state().index.lookup(position)
    }
}
