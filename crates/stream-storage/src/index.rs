//! position index shared by the storage implementations

use crate::{validate_range, Address, Position, StorageError, MIN_POSITION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRange {
    pub lowest: Position,
    pub highest: Position,
}

/// ordered block ranges plus the committed block count
#[derive(Debug, Default)]
pub(crate) struct BlockIndex {
    ranges: Vec<BlockRange>,
    committed: usize,
}

impl BlockIndex {
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn last_highest(&self) -> Option<Position> {
        self.ranges.last().map(|range| range.highest)
    }

    pub fn check(&self, lowest: Position, highest: Position) -> Result<(), StorageError> {
        validate_range(lowest, highest, self.last_highest())
    }

    /// register a new block and return its address
    pub fn push(&mut self, lowest: Position, highest: Position) -> Address {
        self.ranges.push(BlockRange { lowest, highest });
        self.ranges.len() as Address
    }

    /// drop the most recent block again after a failed write
    pub fn pop(&mut self) {
        self.ranges.pop();
        self.committed = self.committed.min(self.ranges.len());
    }

    pub fn range(&self, address: Address) -> Option<BlockRange> {
        let slot = usize::try_from(address).ok()?.checked_sub(1)?;
        self.ranges.get(slot).copied()
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    /// mark every block up to and including `address` committed
    pub fn commit_up_to(&mut self, address: Address) {
        let address = (address as usize).min(self.ranges.len());
        self.committed = self.committed.max(address);
    }

    pub fn is_committed(&self, address: Address) -> bool {
        address >= 1 && address as usize <= self.committed
    }

    pub fn lookup(&self, position: Position) -> Option<Address> {
        if self.ranges.is_empty() {
            return None;
        }
        if position == MIN_POSITION {
            return Some(1);
        }
        // number of blocks starting at or before `position`
        let starting_before = self.ranges.partition_point(|range| range.lowest <= position);
        Some(starting_before.max(1) as Address)
    }
}
