use crate::server::{streaming::request::WorkRequest, telemetry::record_forced_finish};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Worker task responsible for processing [`WorkRequest`] messages.
///
/// Processors may run their backend calls inline, so each one is started on
/// the blocking thread pool. A worker starts one processor at a time; the
/// number of workers bounds how many start concurrently.
///
/// # Request Types
///
/// - [`WorkRequest::Process`] - Calls `process()` on a dispatched processor.
///   A processor that panics is finished on its behalf with an error, so its
///   reply still completes.
/// - [`WorkRequest::Shutdown`] - Signals the worker to stop and acknowledge
///   shutdown.
pub async fn worker_loop(_worker_id: usize, mut rx: mpsc::Receiver<WorkRequest>) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Process {
                processor,
                dispatcher,
                request_id,
            } => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Worker {_worker_id} starting {}", processor.name());

                let running = Arc::clone(&processor);
                if let Err(_e) = tokio::task::spawn_blocking(move || running.process()).await {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        request_id,
                        "Worker {_worker_id}: processor {} panicked: {_e}",
                        processor.name()
                    );
                    dispatcher.force_finish(request_id, &processor);
                    record_forced_finish("panic", 1);
                }
            }
            WorkRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {_worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} stopped");
}
