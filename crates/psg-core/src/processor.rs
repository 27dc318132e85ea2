//! The processor contract.
//!
//! Every backend implements [`Processor`]. A registered instance acts as a
//! factory: the dispatcher asks it [`Processor::can_process`] for each
//! request and, if so, calls [`Processor::create_processor`] to obtain a
//! request-scoped instance that does the actual work.

use crate::common::{ProcessorStatus, SignalSource, StartProcessing};
use crate::dispatcher::Dispatcher;
use crate::reply::Reply;
use crate::request::{Request, RequestKind};
use portable_atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// A backend able to serve some kinds of requests.
pub trait Processor: Send + Sync {
    /// Request kinds this processor may accept. Informational only.
    fn what_can_process(&self) -> Vec<RequestKind> {
        Vec::new()
    }

    /// Side-effect free check whether this processor wants the request.
    fn can_process(&self, request: &Request, reply: &Reply) -> bool;

    /// Creates the request-scoped instance. `None` declines the request.
    fn create_processor(&self, ctx: ProcessorContext) -> Option<Arc<dyn Processor>>;

    /// Starts the work. Must return without waiting for backend I/O.
    fn process(&self);

    /// Idempotent. The processor still reports a terminal status to the
    /// dispatcher afterwards.
    fn cancel(&self);

    fn status(&self) -> ProcessorStatus;

    /// Also used as `processor_id` in reply chunks.
    fn name(&self) -> &'static str;

    fn group_name(&self) -> &'static str;
}

/// Everything a request-scoped processor needs to talk to the framework.
#[derive(Clone)]
pub struct ProcessorContext {
    key: usize,
    request: Arc<Request>,
    reply: Arc<Reply>,
    priority: u32,
    dispatcher: Weak<Dispatcher>,
}

impl ProcessorContext {
    pub(crate) fn new(
        key: usize,
        request: Arc<Request>,
        reply: Arc<Reply>,
        priority: u32,
        dispatcher: Weak<Dispatcher>,
    ) -> Self {
        Self {
            key,
            request,
            reply,
            priority,
            dispatcher,
        }
    }

    /// Identity of the processor within the dispatcher.
    pub const fn key(&self) -> usize {
        self.key
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub fn reply(&self) -> &Arc<Reply> {
        &self.reply
    }

    /// Higher values mean higher priority.
    pub const fn priority(&self) -> u32 {
        self.priority
    }

    /// Asks the dispatcher for the right to send data. A processor that gets
    /// [`StartProcessing::Cancel`] must stop and finish as canceled.
    pub fn signal_start_processing(&self) -> StartProcessing {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.signal_start_processing(self),
            None => StartProcessing::Cancel,
        }
    }

    /// Reports that the processor reached its terminal status.
    pub fn signal_finish_processing(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.signal_finish_processing(self, SignalSource::Processor);
        }
    }

    /// Sends a trace message if the request asked for tracing.
    pub fn trace(&self, msg: &str) {
        if self.request.need_trace() {
            self.reply.send_trace(msg, self.request.created());
        }
    }
}

/// Lock-free status cell allowing a single terminal transition.
#[derive(Debug)]
pub struct ProcessorState(AtomicU8);

impl ProcessorState {
    pub const fn new() -> Self {
        Self(AtomicU8::new(ProcessorStatus::InProgress as u8))
    }

    pub fn get(&self) -> ProcessorStatus {
        ProcessorStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_in_progress(&self) -> bool {
        self.get() == ProcessorStatus::InProgress
    }

    /// Moves from `InProgress` to `status`. Returns `false` if a terminal
    /// status was already recorded.
    pub fn try_finish(&self, status: ProcessorStatus) -> bool {
        debug_assert!(status.is_terminal());
        self.0
            .compare_exchange(
                ProcessorStatus::InProgress as u8,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Canceled` may replace `InProgress` at any time; terminal states are
    /// kept.
    pub fn cancel(&self) -> bool {
        self.try_finish(ProcessorStatus::Canceled)
    }
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self::new()
    }
}
