//! # controller
//!
//! why: run a partition's processing loop as its own task and stop it on demand
//! relations: wraps state_machine.rs; used by whoever owns partition leadership
//! what: spawn(), ProcessorHandle, ProcessorExit

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ProcessingError;
use crate::state::StateStore;
use crate::state_machine::{ProcessingStateMachine, StopReason};

/// The machine handed back after its task ended, with the reason it stopped
pub struct ProcessorExit<S: StateStore> {
    pub machine: ProcessingStateMachine<S>,
    pub result: Result<StopReason, ProcessingError>,
}

/// Handle to a spawned processing loop
pub struct ProcessorHandle<S: StateStore> {
    name: String,
    shutdown: CancellationToken,
    task: JoinHandle<ProcessorExit<S>>,
}

/// Spawn `machine` on the current tokio runtime
pub fn spawn<S: StateStore + 'static>(mut machine: ProcessingStateMachine<S>) -> ProcessorHandle<S> {
    let name = machine.name().to_string();
    let shutdown = machine.shutdown_token();
    info!(processor = %name, "spawning processing task");

    let task = tokio::spawn(async move {
        let result = machine.run().await;
        ProcessorExit { machine, result }
    });

    ProcessorHandle {
        name,
        shutdown,
        task,
    }
}

impl<S: StateStore + 'static> ProcessorHandle<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Token that stops the loop between cycles when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel the loop and wait for it; a cycle past its commit still finishes
    pub async fn stop(self) -> Result<ProcessorExit<S>, ProcessingError> {
        info!(processor = %self.name, "stopping processing task");
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the loop to end on its own, by abort condition or fault
    pub async fn join(self) -> Result<ProcessorExit<S>, ProcessingError> {
        Ok(self.task.await?)
    }
}
