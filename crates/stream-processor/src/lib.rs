//! # stream-processor
//!
//! why: run business logic over a partition log with transactional state and exactly one output per record
//! relations: builds on stream-core records and stream-storage blocks
//! what: log stream, record writer, state store, processor contract, processing state machine, controller

pub mod config;
pub mod controller;
pub mod error;
pub mod log_stream;
pub mod observability;
pub mod processor;
pub mod state;
pub mod state_machine;
pub mod writer;

pub use config::{ProcessingConfig, StorageRetryPolicy};
pub use controller::{spawn, ProcessorExit, ProcessorHandle};
pub use error::{ConfigError, CyclePhase, LogStreamError, ProcessingError, StateError, WriterError};
pub use log_stream::{LogStream, LogStreamReader};
pub use processor::{
    EventProcessor, RecordProcessor, RecordProcessors, RejectionProcessor, SkipEventProcessor,
    StreamProcessor,
};
pub use state::{
    get_json, put_json, MemoryStateStore, PendingOutput, StateStore, LAST_PROCESSED_POSITION_KEY,
    PENDING_OUTPUT_KEY,
};
pub use state_machine::{
    CycleOutcome, CyclePath, ProcessingMetrics, ProcessingStateMachine, ProcessingStep, StopReason,
};
pub use writer::RecordWriter;
