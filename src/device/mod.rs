//! Compute backend: a command queue served by worker threads and the gate
//! that bounds how much work is in flight.

pub mod gate;
pub mod queue;

pub use gate::{GatePermit, InFlightGate};
pub use queue::{CommandBuffer, CommandHandle, CommandQueue, CommandState};

use crate::error::Result;

/// Handle to the compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    workers: usize,
}

impl Device {
    /// The default backend with `workers` execution threads.
    pub fn system_default(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(crate::error::EngineError::ResourceAcquisition(
                "no compute workers available".into(),
            ));
        }
        Ok(Self { workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn make_command_queue(&self) -> Result<CommandQueue> {
        CommandQueue::new(self.workers)
    }
}
