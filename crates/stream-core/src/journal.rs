//! # journal
//!
//! why: define the unit that is stored in and replayed from a partition log
//! relations: framed into blocks by the log stream writer, stored by stream-storage
//! what: JournalEntry struct, binary block framing, index ordering checks

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a record inside a partition log
pub type Position = u64;

/// Smallest position a caller can ask for; resolves to the first stored block
pub const MIN_POSITION: Position = 0;

/// Bytes in front of every framed payload: 8 byte index + 4 byte length
pub const FRAME_HEADER_LENGTH: usize = 12;

/// A single immutable entry in the journal
///
/// The size is cached at construction so iterating over entries never has to
/// re-serialize the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position of this entry, strictly increasing per append
    index: Position,
    /// Opaque serialized record
    payload: Vec<u8>,
    /// Byte length of the payload
    size: u32,
}

/// Errors raised while decoding a framed block
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated frame at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("entry index {index} does not follow previous index {previous}")]
    NonIncreasingIndex { previous: Position, index: Position },

    #[error("payload of {0} bytes exceeds the frame size limit")]
    PayloadTooLarge(usize),
}

impl JournalEntry {
    /// Create a new journal entry
    ///
    /// `size` saturates at `u32::MAX`; [`encode_block`] rejects such payloads.
    pub fn new(index: Position, payload: Vec<u8>) -> Self {
        let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        Self { index, payload, size }
    }

    pub fn index(&self) -> Position {
        self.index
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serialized payload size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Length of this entry once framed
    pub fn framed_length(&self) -> usize {
        FRAME_HEADER_LENGTH + self.size as usize
    }

    /// Append the framed form of this entry to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.framed_length());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.payload);
    }
}

/// Frame a batch of entries into one block
///
/// Entries must be passed in strictly increasing index order.
pub fn encode_block(entries: &[JournalEntry]) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(entries.iter().map(JournalEntry::framed_length).sum());
    let mut previous: Option<Position> = None;

    for entry in entries {
        if entry.payload.len() > u32::MAX as usize {
            return Err(CodecError::PayloadTooLarge(entry.payload.len()));
        }
        if let Some(previous) = previous {
            if entry.index <= previous {
                return Err(CodecError::NonIncreasingIndex {
                    previous,
                    index: entry.index,
                });
            }
        }
        previous = Some(entry.index);
        entry.encode_into(&mut buf);
    }

    Ok(buf)
}

/// Decode every framed entry contained in a block
pub fn decode_block(block: &[u8]) -> Result<Vec<JournalEntry>, CodecError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    let mut previous: Option<Position> = None;

    while offset < block.len() {
        let available = block.len() - offset;
        if available < FRAME_HEADER_LENGTH {
            return Err(CodecError::Truncated {
                offset,
                needed: FRAME_HEADER_LENGTH,
                available,
            });
        }

        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&block[offset..offset + 8]);
        let index = u64::from_le_bytes(index_bytes);

        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&block[offset + 8..offset + FRAME_HEADER_LENGTH]);
        let size = u32::from_le_bytes(size_bytes) as usize;

        let start = offset + FRAME_HEADER_LENGTH;
        if block.len() - start < size {
            return Err(CodecError::Truncated {
                offset,
                needed: FRAME_HEADER_LENGTH + size,
                available,
            });
        }

        if let Some(previous) = previous {
            if index <= previous {
                return Err(CodecError::NonIncreasingIndex { previous, index });
            }
        }
        previous = Some(index);

        entries.push(JournalEntry::new(index, block[start..start + size].to_vec()));
        offset = start + size;
    }

    Ok(entries)
}
