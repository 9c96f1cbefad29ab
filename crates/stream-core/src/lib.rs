//! # stream-core
//!
//! why: hold the pure, storage-independent building blocks of a partition log
//! relations: used by stream-storage for positions, stream-processor for records and leadership
//! what: journal entries and block framing, record model, quorum counting, election state

pub mod election;
pub mod journal;
pub mod quorum;
pub mod record;

pub use election::{ElectionCoordinator, ElectionOutcome, NodeRole};
pub use journal::{decode_block, encode_block, CodecError, JournalEntry, Position, MIN_POSITION};
pub use quorum::Quorum;
pub use record::{LoggedRecord, Record, RecordType};
