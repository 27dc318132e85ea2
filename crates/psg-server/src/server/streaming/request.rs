use psg_core::{dispatcher::Dispatcher, processor::Processor};
use std::sync::Arc;
use tokio::sync::oneshot;

/// A message sent from the worker pool to an individual worker task.
pub enum WorkRequest {
    /// Start a dispatched processor.
    ///
    /// - `dispatcher` and `request_id`: where to report the processor as
    ///   finished if `process()` panics.
    Process {
        processor: Arc<dyn Processor>,
        dispatcher: Arc<Dispatcher>,
        request_id: usize,
    },

    /// Request the worker to shut down gracefully.
    ///
    /// - `response`: One-shot channel for acknowledging that the worker has
    ///   completed its shutdown routine.
    Shutdown { response: oneshot::Sender<()> },
}

impl core::fmt::Debug for WorkRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Process {
                processor,
                request_id,
                ..
            } => f
                .debug_struct("Process")
                .field("processor", &processor.name())
                .field("request_id", request_id)
                .finish(),
            Self::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}
