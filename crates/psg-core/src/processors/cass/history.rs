use super::{CassProcessorKind, CassServices, GROUP_NAME};
use crate::backend::{AccVerHistoryRecord, BackendError, BioseqInfo};
use crate::common::{ErrorCode, ProcessorStatus, status};
use crate::processor::{Processor, ProcessorContext, ProcessorState};
use crate::processors::{LocalStatus, StartGate, to_json};
use crate::reply::{Diagnostic, Reply};
use crate::request::{AccVerHistoryRequest, Request, RequestPayload};
use std::sync::{Arc, Weak};

/// Answers `/ID/get_acc_ver_history`: resolves the seq-id, then sends one
/// `acc_ver_history` item per version of the accession.
pub struct CassAccVerHistoryProcessor {
    ctx: ProcessorContext,
    services: Arc<CassServices>,
    request: AccVerHistoryRequest,
    state: ProcessorState,
    local: LocalStatus,
    gate: StartGate,
    me: Weak<Self>,
}

impl CassAccVerHistoryProcessor {
    pub(super) fn create(ctx: ProcessorContext, services: Arc<CassServices>) -> Option<Arc<dyn Processor>> {
        let RequestPayload::AccVerHistory(request) = ctx.request().payload() else {
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
        match result {
            Ok(Some(info)) => {
                let me = self.me.clone();
                self.services.bioseq.acc_ver_history(
                    &info.accession,
                    Box::new(move |result| {
                        if let Some(me) = me.upgrade() {
                            me.on_history(result);
                        }
                    }),
                );
            }
            Ok(None) => {
                let text = format!("Could not resolve seq_id {}", self.request.seq_id);
                self.fail(status::NOT_FOUND, ErrorCode::UnresolvedSeqId, &text);
            }
            Err(e) => self.fail(e.status.max(status::INTERNAL), e.code, &e.message),
        }
    }

    fn on_history(&self, result: Result<Vec<AccVerHistoryRecord>, BackendError>) {
        if !self.state.is_in_progress() {
            return;
        }
        let records = match result {
            Ok(records) if records.is_empty() => {
                let text = format!("No accession version history for {}", self.request.seq_id);
                return self.fail(status::NOT_FOUND, ErrorCode::AccVerHistoryNotFound, &text);
            }
            Ok(records) => records,
            Err(e) => return self.fail(e.status.max(status::INTERNAL), e.code, &e.message),
        };
        if !self.gate.admit(&self.ctx) {
            self.cancel();
            return;
        }
        let reply = self.ctx.reply();
        for record in &records {
            if let Some(content) = to_json(record, &self.local, "history record") {
                reply.prepare_acc_ver_history_data(self.name(), &content);
            }
        }
        self.finish(self.local.finish_status());
    }

    /// Reports `text` as a processor message and finishes.
    fn fail(&self, code: u16, error_code: ErrorCode, text: &str) {
        if !self.gate.admit(&self.ctx) {
            self.cancel();
            return;
        }
        self.local.raise(code);
        let reply = self.ctx.reply();
        reply.prepare_processor_message(reply.item_id(), self.name(), Diagnostic::error(text, code, error_code));
        self.finish(self.local.finish_status());
    }

    fn finish(&self, status: ProcessorStatus) {
        if self.state.try_finish(status) {
            self.ctx.signal_finish_processing();
        }
    }
}

impl Processor for CassAccVerHistoryProcessor {
    fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
        false
    }

    fn create_processor(&self, _ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        None
    }

    fn process(&self) {
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
        CassProcessorKind::AccVerHistory.name()
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}
