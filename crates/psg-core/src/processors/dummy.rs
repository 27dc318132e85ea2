//! A processor that accepts anything and produces nothing. Registered last,
//! it keeps requests no real backend takes from ending with "no processor".

use crate::common::{ProcessorStatus, StartProcessing};
use crate::processor::{Processor, ProcessorContext, ProcessorState};
use crate::reply::Reply;
use crate::request::Request;
use std::sync::Arc;

pub const GROUP_NAME: &str = "DUMMY";

pub struct DummyFactory {
    enabled: bool,
}

impl DummyFactory {
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Processor for DummyFactory {
    fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
        self.enabled
    }

    fn create_processor(&self, ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        Some(Arc::new(DummyProcessor {
            ctx,
            state: ProcessorState::new(),
        }))
    }

    fn process(&self) {}

    fn cancel(&self) {}

    fn status(&self) -> ProcessorStatus {
        ProcessorStatus::InProgress
    }

    fn name(&self) -> &'static str {
        "dummy"
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}

pub struct DummyProcessor {
    ctx: ProcessorContext,
    state: ProcessorState,
}

impl Processor for DummyProcessor {
    fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
        false
    }

    fn create_processor(&self, _ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        None
    }

    fn process(&self) {
        let status = match self.ctx.signal_start_processing() {
            StartProcessing::Proceed => ProcessorStatus::Done,
            StartProcessing::Cancel => ProcessorStatus::Canceled,
        };
        if self.state.try_finish(status) {
            self.ctx.signal_finish_processing();
        }
    }

    fn cancel(&self) {
        if self.state.cancel() {
            self.ctx.signal_finish_processing();
        }
    }

    fn status(&self) -> ProcessorStatus {
        self.state.get()
    }

    fn name(&self) -> &'static str {
        "dummy"
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::reply::MemoryTransport;
    use crate::request::{AccVerHistoryRequest, CacheUsage, RequestPayload, SeqIdQuery};

    fn request() -> Arc<Request> {
        Arc::new(Request::new(RequestPayload::AccVerHistory(AccVerHistoryRequest {
            seq_id: SeqIdQuery::new("NC_000001"),
            use_cache: CacheUsage::Default,
        })))
    }

    #[test]
    fn finishes_done_without_output() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_processor(Arc::new(DummyFactory::new(true)));
        let dispatcher = Arc::new(dispatcher);
        let transport = MemoryTransport::new();

        let processors = dispatcher.dispatch_request(request(), Arc::new(Reply::new(transport.clone())));
        processors[0].process();

        assert_eq!(processors[0].status(), ProcessorStatus::Done);
        assert!(transport.is_finished());
        // Only the reply completion.
        assert_eq!(transport.headers().len(), 1);
    }

    #[test]
    fn disabled_accepts_nothing() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_processor(Arc::new(DummyFactory::new(false)));
        let dispatcher = Arc::new(dispatcher);
        let reply = Arc::new(Reply::new(MemoryTransport::new()));
        assert!(dispatcher.dispatch_request(request(), reply).is_empty());
    }
}
