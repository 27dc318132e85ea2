//! Per-request bookkeeping of processor groups.
//!
//! The [`Dispatcher`] owns the registry of processor factories and, for every
//! request in flight, a group of the processors created for it. It is the
//! single funnel through which processors report progress:
//!
//! - [`Dispatcher::signal_start_processing`] grants the right to send data
//!   (first caller wins, siblings are canceled).
//! - [`Dispatcher::signal_finish_processing`] records terminal states and,
//!   once every processor of a group is finished, writes the reply
//!   completion exactly once.
//! - [`Dispatcher::signal_connection_canceled`] propagates a client drop.
//! - [`Dispatcher::force_finish`] and [`Dispatcher::expire_request`] finish
//!   processors on their behalf when they died or ran past the deadline.
//!
//! `cancel()` on processors is always invoked after the groups lock has been
//! released, so a processor may call back into the dispatcher from it.

use crate::common::{ErrorCode, ProcessorStatus, SignalSource, StartProcessing, status};
use crate::processor::{Processor, ProcessorContext};
use crate::reply::{Diagnostic, Reply};
use crate::request::{Request, RequestKind};
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::{collections::HashMap, sync::Arc};


/// The dispatcher's view of a processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DispatchStatus {
    /// Created and doing what it needs.
    Up,
    /// `cancel()` was called.
    Canceled,
    /// The processor reported a terminal status.
    Finished,
}

struct ProcessorData {
    key: usize,
    processor: Arc<dyn Processor>,
    dispatch_status: DispatchStatus,
    finish_status: ProcessorStatus,
    /// Canceled because a sibling won the start signal; such entries do not
    /// contribute to the aggregated status.
    superseded: bool,
}

struct ProcessorGroup {
    request: Arc<Request>,
    reply: Arc<Reply>,
    processors: Vec<ProcessorData>,
    finalized: bool,
}

impl ProcessorGroup {
    fn entry_mut(&mut self, key: usize) -> Option<&mut ProcessorData> {
        self.processors.iter_mut().find(|p| p.key == key)
    }

    fn all_finished(&self) -> bool {
        self.processors
            .iter()
            .all(|p| p.dispatch_status == DispatchStatus::Finished)
    }

    /// Worst status among the processors, folded with the request-level
    /// status raised through messages.
    fn aggregate_status(&self) -> u16 {
        aggregate_status(
            self.processors
                .iter()
                .filter(|p| !p.superseded)
                .map(|p| p.finish_status),
            self.request.overall_status(),
        )
    }
}

/// Maximum of the mapped processor statuses and `overall`.
pub fn aggregate_status(
    statuses: impl IntoIterator<Item = ProcessorStatus>,
    overall: u16,
) -> u16 {
    statuses
        .into_iter()
        .map(ProcessorStatus::to_http_status)
        .fold(overall, u16::max)
}

/// Summary handed to the finalization step once a group completes.
struct Finalization {
    request: Arc<Request>,
    reply: Arc<Reply>,
    status: u16,
}

/// Routes requests to processors and tracks them until completion.
#[derive(Default)]
pub struct Dispatcher {
    registry: Vec<Arc<dyn Processor>>,
    groups: Mutex<HashMap<usize, ProcessorGroup>>,
    next_key: AtomicUsize,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor factory. Registration order is priority order:
    /// the first registered processor has the highest priority.
    pub fn add_processor(&mut self, processor: Arc<dyn Processor>) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Registered processor {} ({})",
            processor.name(),
            processor.group_name()
        );
        self.registry.push(processor);
    }

    pub fn registered_processors(&self) -> impl Iterator<Item = &Arc<dyn Processor>> {
        self.registry.iter()
    }

    /// Creates the processors that accept `request`, in priority order.
    ///
    /// The caller calls `process()` on each of them. If none is returned the
    /// caller should answer with [`Dispatcher::reply_no_processors`].
    pub fn dispatch_request(
        self: &Arc<Self>,
        request: Arc<Request>,
        reply: Arc<Reply>,
    ) -> Vec<Arc<dyn Processor>> {
        let total = self.registry.len();
        let mut created: Vec<Arc<dyn Processor>> = Vec::new();
        let mut entries = Vec::new();

        for (index, factory) in self.registry.iter().enumerate() {
            if !factory.can_process(&request, &reply) {
                continue;
            }
            let key = self.next_key.fetch_add(1, Ordering::Relaxed);
            let priority = (total - index) as u32;
            let ctx = ProcessorContext::new(
                key,
                Arc::clone(&request),
                Arc::clone(&reply),
                priority,
                Arc::downgrade(self),
            );
            let Some(processor) = factory.create_processor(ctx) else {
                continue;
            };
            #[cfg(feature = "tracing")]
            tracing::debug!(
                request_id = request.id(),
                "Processor {} (priority {priority}) accepted {} request",
                processor.name(),
                request.kind().as_str()
            );
            entries.push(ProcessorData {
                key,
                processor: Arc::clone(&processor),
                dispatch_status: DispatchStatus::Up,
                finish_status: ProcessorStatus::InProgress,
                superseded: false,
            });
            created.push(processor);
        }

        if !entries.is_empty() {
            let group = ProcessorGroup {
                request: Arc::clone(&request),
                reply,
                processors: entries,
                finalized: false,
            };
            if self.groups.lock().insert(request.id(), group).is_some() {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    request_id = request.id(),
                    "Replaced a live processor group for the same request"
                );
            }
        }

        created
    }

    /// Answers a request no processor accepted: a 404 reply message, the
    /// reply completion, and the final flush.
    pub fn reply_no_processors(&self, request: &Request, reply: &Reply) {
        let text = format!(
            "No processor is available to serve the {} request",
            request.kind().as_str()
        );
        request.update_overall_status(status::NOT_FOUND);
        reply.prepare_reply_message(Diagnostic::error(&text, status::NOT_FOUND, ErrorCode::NoProcessor));
        reply.prepare_reply_completion();
        reply.flush(true);
        #[cfg(feature = "tracing")]
        tracing::info!(
            request_id = request.id(),
            status = status::NOT_FOUND,
            "Request finished without processors"
        );
    }

    /// Grants or refuses the right to send data.
    ///
    /// The first processor to call wins: every other processor of the group
    /// still `Up` is canceled. A processor that was already canceled gets
    /// [`StartProcessing::Cancel`]. Annotation requests are served by several
    /// processors together, so there the call only checks for cancellation;
    /// per-name exclusivity goes through [`Request::claim_resource`].
    pub fn signal_start_processing(&self, ctx: &ProcessorContext) -> StartProcessing {
        let losers: Vec<Arc<dyn Processor>> = {
            let mut groups = self.groups.lock();
            let Some(group) = groups.get_mut(&ctx.request().id()) else {
                return StartProcessing::Cancel;
            };
            let shared = group.request.kind() == RequestKind::Annot;
            let Some(entry) = group.entry_mut(ctx.key()) else {
                return StartProcessing::Cancel;
            };
            if entry.dispatch_status != DispatchStatus::Up {
                return StartProcessing::Cancel;
            }
            if shared {
                return StartProcessing::Proceed;
            }
            group
                .processors
                .iter_mut()
                .filter(|p| p.key != ctx.key() && p.dispatch_status == DispatchStatus::Up)
                .map(|p| {
                    p.dispatch_status = DispatchStatus::Canceled;
                    p.superseded = true;
                    Arc::clone(&p.processor)
                })
                .collect()
        };

        for processor in losers {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                request_id = ctx.request().id(),
                "Canceling {}: another processor started first",
                processor.name()
            );
            processor.cancel();
        }
        StartProcessing::Proceed
    }

    /// Records that a processor reached its terminal status. When it was the
    /// last one of its group, the reply is completed and flushed.
    pub fn signal_finish_processing(&self, ctx: &ProcessorContext, source: SignalSource) {
        let key = ctx.key();
        self.finish_where(ctx.request().id(), source, None, |p| p.key == key);
    }

    /// Finishes a processor on its behalf, with an `Error` status, after it
    /// died without reporting (a panic in `process()` for instance). The
    /// processor is then canceled so that any work it left behind stops.
    pub fn force_finish(&self, request_id: usize, processor: &Arc<dyn Processor>) {
        let target = Arc::as_ptr(processor).cast::<()>();
        let forced = self.finish_where(
            request_id,
            SignalSource::Framework,
            Some("failed unexpectedly"),
            |p| Arc::as_ptr(&p.processor).cast::<()>() == target,
        );
        for processor in forced {
            processor.cancel();
        }
    }

    /// Finishes every processor of the request that has not reported yet,
    /// with an `Error` status, and cancels them. Called once the request
    /// deadline has passed. Returns how many processors were forced.
    pub fn expire_request(&self, request_id: usize) -> usize {
        let forced = self.finish_where(
            request_id,
            SignalSource::Framework,
            Some("did not finish before the request deadline"),
            |p| p.dispatch_status != DispatchStatus::Finished,
        );
        let count = forced.len();
        for processor in forced {
            processor.cancel();
        }
        count
    }

    /// Marks the selected entries of a group `Finished` and finalizes the
    /// group when nothing is left running.
    ///
    /// With `forced` set the entries get an `Error` status regardless of what
    /// the processors report, a processor message carrying the reason is
    /// written for each of them, and they are returned for cancellation.
    fn finish_where(
        &self,
        request_id: usize,
        source: SignalSource,
        forced: Option<&str>,
        select: impl Fn(&ProcessorData) -> bool,
    ) -> Vec<Arc<dyn Processor>> {
        let mut finished: Vec<(Arc<dyn Processor>, bool)> = Vec::new();
        let (reply, finalization) = {
            let mut groups = self.groups.lock();
            let Some(group) = groups.get_mut(&request_id) else {
                return Vec::new();
            };
            for entry in group.processors.iter_mut().filter(|p| select(p)) {
                if entry.dispatch_status == DispatchStatus::Finished {
                    continue;
                }
                entry.dispatch_status = DispatchStatus::Finished;
                entry.finish_status = match forced {
                    Some(_) => ProcessorStatus::Error,
                    None => entry.processor.status(),
                };

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    request_id,
                    "Processor {} finished with {} (signaled by {})",
                    entry.processor.name(),
                    entry.finish_status,
                    source.as_str()
                );
                finished.push((Arc::clone(&entry.processor), entry.superseded));
            }
            #[cfg(not(feature = "tracing"))]
            let _ = source;

            if finished.is_empty() {
                return Vec::new();
            }
            let finalization = if !group.finalized && group.all_finished() {
                group.finalized = true;
                Some(Finalization {
                    request: Arc::clone(&group.request),
                    reply: Arc::clone(&group.reply),
                    status: group.aggregate_status(),
                })
            } else {
                None
            };
            (Arc::clone(&group.reply), finalization)
        };

        let Some(reason) = forced else {
            if let Some(finalization) = finalization {
                Self::finalize(finalization);
            }
            return Vec::new();
        };

        // The messages go out before the completion the finalization writes.
        for (processor, superseded) in &finished {
            #[cfg(feature = "tracing")]
            tracing::error!(request_id, "Processor {} {reason}", processor.name());
            if *superseded || reply.is_finished() {
                continue;
            }
            let text = format!("Processor {} {reason}", processor.name());
            reply.prepare_processor_message(
                reply.item_id(),
                processor.name(),
                Diagnostic::error(&text, status::INTERNAL, ErrorCode::UnknownError),
            );
        }
        if let Some(finalization) = finalization {
            Self::finalize(finalization);
        } else {
            reply.flush(false);
        }
        finished.into_iter().map(|(processor, _)| processor).collect()
    }

    fn finalize(finalization: Finalization) {
        let Finalization {
            request,
            reply,
            status,
        } = finalization;

        request.update_overall_status(status);
        if !reply.is_finished() && reply.is_output_ready() {
            if request.need_trace() {
                reply.send_trace(
                    &format!("Request finished with status {status}"),
                    request.created(),
                );
            }
            reply.prepare_reply_completion();
            reply.flush(true);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            request_id = request.id(),
            status,
            n_chunks = reply.total_chunks(),
            elapsed_us = request.created().elapsed().as_micros() as u64,
            "Request {} stopped",
            request.kind().as_str()
        );
    }

    /// The client dropped the connection: silence the reply and cancel every
    /// processor still up. Each of them then reports `Canceled`.
    pub fn signal_connection_canceled(&self, request_id: usize) {
        let (reply, to_cancel) = {
            let mut groups = self.groups.lock();
            let Some(group) = groups.get_mut(&request_id) else {
                return;
            };
            let to_cancel: Vec<Arc<dyn Processor>> = group
                .processors
                .iter_mut()
                .filter(|p| p.dispatch_status == DispatchStatus::Up)
                .map(|p| {
                    p.dispatch_status = DispatchStatus::Canceled;
                    Arc::clone(&p.processor)
                })
                .collect();
            (Arc::clone(&group.reply), to_cancel)
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            request_id,
            "Connection canceled, canceling {} processor(s)",
            to_cancel.len()
        );

        reply.connection_cancel();
        for processor in to_cancel {
            processor.cancel();
        }
    }

    /// Drops the bookkeeping of a request whose connection is gone.
    pub fn notify_request_finished(&self, request_id: usize) {
        let Some(group) = self.groups.lock().remove(&request_id) else {
            return;
        };
        let live = group
            .processors
            .iter()
            .filter(|p| p.dispatch_status != DispatchStatus::Finished)
            .count();
        if live > 0 {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                request_id,
                "Processor group torn down with {live} unfinished processor(s)"
            );
        }
        // Processors are dropped here, outside the groups lock.
        drop(group);
    }

    /// Number of requests with live bookkeeping.
    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }
}
