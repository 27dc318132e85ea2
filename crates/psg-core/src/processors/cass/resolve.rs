use super::{CassProcessorKind, CassServices, GROUP_NAME};
use crate::backend::{BackendError, BioseqInfo};
use crate::common::{ErrorCode, ProcessorStatus, status};
use crate::processor::{Processor, ProcessorContext, ProcessorState};
use crate::processors::{LocalStatus, StartGate};
use crate::protocol::OutputFormat;
use crate::reply::{Diagnostic, Reply};
use crate::request::{Request, RequestPayload, ResolveRequest};
use std::sync::{Arc, Weak};

/// Answers `/ID/resolve` with one `bioseq_info` item.
pub struct CassResolveProcessor {
    ctx: ProcessorContext,
    services: Arc<CassServices>,
    request: ResolveRequest,
    state: ProcessorState,
    local: LocalStatus,
    gate: StartGate,
    me: Weak<Self>,
}

impl CassResolveProcessor {
    pub(super) fn create(ctx: ProcessorContext, services: Arc<CassServices>) -> Option<Arc<dyn Processor>> {
        let RequestPayload::Resolve(request) = ctx.request().payload() else {
            return None;
        };
        let request = request.clone();
        Some(Arc::new_cyclic(|me| Self {
            ctx,
            services,
            request,
            state: ProcessorState::new(),
            local: LocalStatus::new(),
            gate: StartGate::default(),
            me: me.clone(),
        }))
    }

    fn on_resolved(&self, result: Result<Option<BioseqInfo>, BackendError>) {
        if !self.state.is_in_progress() {
            return;
        }
        if !self.gate.admit(&self.ctx) {
            self.cancel();
            return;
        }
        let reply = self.ctx.reply();
        let item_id = reply.item_id();
        let name = self.name();
        match result {
            Ok(Some(info)) => {
                let content = match self.request.output_format {
                    OutputFormat::Json => info.to_json(self.request.include),
                    OutputFormat::Protobuf => info.to_protobuf(self.request.include),
                };
                reply.prepare_bioseq_data(item_id, name, &content, self.request.output_format);
                reply.prepare_bioseq_completion(item_id, name, 2);
            }
            Ok(None) => {
                let text = format!("Could not resolve seq_id {}", self.request.seq_id);
                self.local.raise(status::NOT_FOUND);
                reply.prepare_bioseq_message(
                    item_id,
                    name,
                    Diagnostic::error(&text, status::NOT_FOUND, ErrorCode::UnresolvedSeqId),
                );
                reply.prepare_bioseq_completion(item_id, name, 2);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(request_id = self.ctx.request().id(), "Resolution failed: {e}");
                self.local.raise(e.status.max(status::INTERNAL));
                reply.prepare_bioseq_message(
                    item_id,
                    name,
                    Diagnostic::new(&e.message, e.status, e.code, e.severity),
                );
                reply.prepare_bioseq_completion(item_id, name, 2);
            }
        }
        self.finish(self.local.finish_status());
    }

    fn finish(&self, status: ProcessorStatus) {
        if self.state.try_finish(status) {
            self.ctx.trace(&format!("{} finished: {status}", self.name()));
            self.ctx.signal_finish_processing();
        }
    }
}

impl Processor for CassResolveProcessor {
    fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
        false
    }

    fn create_processor(&self, _ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        None
    }

    fn process(&self) {
        self.ctx.trace(&format!("{} started", self.name()));
        let me = self.me.clone();
        self.services.resolve_seq_id(
            &self.request.seq_id,
            self.request.use_cache,
            Box::new(move |result| {
                if let Some(me) = me.upgrade() {
                    me.on_resolved(result);
                }
            }),
        );
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
        CassProcessorKind::Resolve.name()
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}
