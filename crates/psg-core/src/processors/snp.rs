//! SNP annotation tracks (`SNP*` names).

use crate::backend::{NamedAnnotRecord, SnpClient};
use crate::common::{Error, ErrorCode, ProcessorStatus, Result, status};
use crate::processor::{Processor, ProcessorContext, ProcessorState};
use crate::processors::{LocalStatus, StartGate, claim, to_json};
use crate::reply::{Diagnostic, Reply};
use crate::request::{Request, RequestKind, RequestPayload, SeqIdQuery};
use std::sync::{Arc, Weak};
use std::thread;

pub const GROUP_NAME: &str = "SNP";

fn is_snp_name(name: &str) -> bool {
    name.starts_with("SNP")
}

pub struct SnpFactory {
    client: Arc<dyn SnpClient>,
}

impl SnpFactory {
    pub fn new(client: Arc<dyn SnpClient>) -> Self {
        Self { client }
    }
}

impl Processor for SnpFactory {
    fn what_can_process(&self) -> Vec<RequestKind> {
        vec![RequestKind::Annot]
    }

    fn can_process(&self, request: &Request, _reply: &Reply) -> bool {
        matches!(request.payload(), RequestPayload::Annot(r) if r.names.iter().any(|n| is_snp_name(n)))
    }

    fn create_processor(&self, ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        let RequestPayload::Annot(request) = ctx.request().payload() else {
            return None;
        };
        let seq_id = request.seq_id.clone();
        let names = request.names.iter().filter(|n| is_snp_name(n)).cloned().collect();
        let client = Arc::clone(&self.client);
        Some(Arc::new_cyclic(|me| SnpProcessor {
            ctx,
            client,
            seq_id,
            names,
            state: ProcessorState::new(),
            local: LocalStatus::new(),
            gate: StartGate::default(),
            me: me.clone(),
        }))
    }

    fn process(&self) {}

    fn cancel(&self) {}

    fn status(&self) -> ProcessorStatus {
        ProcessorStatus::InProgress
    }

    fn name(&self) -> &'static str {
        "SNP"
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}

pub struct SnpProcessor {
    ctx: ProcessorContext,
    client: Arc<dyn SnpClient>,
    seq_id: SeqIdQuery,
    /// The requested names this processor is responsible for.
    names: Vec<String>,
    state: ProcessorState,
    local: LocalStatus,
    gate: StartGate,
    me: Weak<Self>,
}

impl SnpProcessor {
    fn on_fetched(&self, result: Result<Vec<NamedAnnotRecord>>) {
        if !self.state.is_in_progress() {
            return;
        }
        if !self.gate.admit(&self.ctx) {
            self.cancel();
            return;
        }
        let reply = self.ctx.reply();
        match result {
            Ok(records) if records.is_empty() => self.local.raise(status::NOT_FOUND),
            Ok(records) => {
                for record in records.iter().filter(|r| claim(&self.ctx, &r.annot_name)) {
                    let Some(content) = to_json(record, &self.local, "SNP annotation") else {
                        continue;
                    };
                    reply.prepare_named_annotation_data(&record.annot_name, self.name(), &content);
                }
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(request_id = self.ctx.request().id(), "SNP fetch failed: {e}");
                self.local.raise(status::INTERNAL);
                let text = e.to_string();
                reply.prepare_processor_message(
                    reply.item_id(),
                    self.name(),
                    Diagnostic::error(&text, status::INTERNAL, ErrorCode::UnknownError),
                );
            }
        }
        if self.state.try_finish(self.local.finish_status()) {
            self.ctx.signal_finish_processing();
        }
    }
}

impl Processor for SnpProcessor {
    fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
        false
    }

    fn create_processor(&self, _ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        None
    }

    fn process(&self) {
        if !self.state.is_in_progress() {
            return;
        }
        self.ctx.trace(&format!("SNP started for {}", self.names.join(",")));
        let me = self.me.clone();
        let client = Arc::clone(&self.client);
        let (seq_id, names) = (self.seq_id.clone(), self.names.clone());
        let spawned = thread::Builder::new().name("snp-fetch".into()).spawn(move || {
            let result = client.fetch_annotations(&seq_id, &names);
            if let Some(me) = me.upgrade() {
                me.on_fetched(result);
            }
        });
        if let Err(e) = spawned {
            self.on_fetched(Err(Error::Backend { message: e.to_string() }));
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
        "SNP"
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}
