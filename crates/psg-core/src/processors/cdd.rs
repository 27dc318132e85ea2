//! Conserved domain annotations.

use crate::backend::{CddClient, NamedAnnotRecord};
use crate::common::{Error, ErrorCode, ProcessorStatus, Result, status};
use crate::processor::{Processor, ProcessorContext, ProcessorState};
use crate::processors::{LocalStatus, StartGate, claim, to_json};
use crate::reply::{Diagnostic, Reply};
use crate::request::{AnnotRequest, Request, RequestKind, RequestPayload};
use std::sync::{Arc, Weak};
use std::thread;

pub const GROUP_NAME: &str = "CDD";
pub const ANNOT_NAME: &str = "CDD";

/// Registry entry for the CDD processor.
pub struct CddFactory {
    client: Arc<dyn CddClient>,
}

impl CddFactory {
    pub fn new(client: Arc<dyn CddClient>) -> Self {
        Self { client }
    }
}

impl Processor for CddFactory {
    fn what_can_process(&self) -> Vec<RequestKind> {
        vec![RequestKind::Annot]
    }

    fn can_process(&self, request: &Request, _reply: &Reply) -> bool {
        matches!(request.payload(), RequestPayload::Annot(r) if r.names.iter().any(|n| n == ANNOT_NAME))
    }

    fn create_processor(&self, ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        let RequestPayload::Annot(request) = ctx.request().payload() else {
            return None;
        };
        let request = request.clone();
        let client = Arc::clone(&self.client);
        Some(Arc::new_cyclic(|me| CddProcessor {
            ctx,
            client,
            request,
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
        "CDD"
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}

/// Fetches the `CDD` annotation of one seq-id on a background thread.
pub struct CddProcessor {
    ctx: ProcessorContext,
    client: Arc<dyn CddClient>,
    request: AnnotRequest,
    state: ProcessorState,
    local: LocalStatus,
    gate: StartGate,
    me: Weak<Self>,
}

impl CddProcessor {
    fn on_fetched(&self, result: Result<Option<NamedAnnotRecord>>) {
        if !self.state.is_in_progress() {
            return;
        }
        if !self.gate.admit(&self.ctx) {
            self.cancel();
            return;
        }
        let reply = self.ctx.reply();
        match result {
            Ok(Some(record)) => {
                if claim(&self.ctx, ANNOT_NAME) {
                    if let Some(content) = to_json(&record, &self.local, "the CDD annotation") {
                        reply.prepare_named_annotation_data(ANNOT_NAME, self.name(), &content);
                    }
                }
            }
            Ok(None) => self.local.raise(status::NOT_FOUND),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(request_id = self.ctx.request().id(), "CDD fetch failed: {e}");
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
            self.ctx.trace(&format!("CDD finished: {}", self.state.get()));
            self.ctx.signal_finish_processing();
        }
    }
}

impl Processor for CddProcessor {
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
        let me = self.me.clone();
        let client = Arc::clone(&self.client);
        let query = self.request.seq_id.clone();
        let spawned = thread::Builder::new().name("cdd-fetch".into()).spawn(move || {
            let result = client.fetch_annotation(&query);
            if let Some(me) = me.upgrade() {
                me.on_fetched(result);
            }
        });
        if let Err(e) = spawned {
            #[cfg(feature = "tracing")]
            tracing::error!("Cannot start the CDD fetch thread: {e}");
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
        "CDD"
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCddClient;
    use crate::dispatcher::Dispatcher;
    use crate::reply::MemoryTransport;
    use crate::request::{BlobOptions, SeqIdQuery};
    use core::time::Duration;
    use std::time::Instant;

    fn annot_request(names: &[&str]) -> Request {
        Request::new(RequestPayload::Annot(AnnotRequest {
            seq_id: SeqIdQuery::new("NC_000001.11"),
            names: names.iter().map(|n| (*n).to_owned()).collect(),
            options: BlobOptions::default(),
        }))
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let client = MemoryCddClient::new(vec![NamedAnnotRecord {
            accession: "NC_000001".into(),
            version: 11,
            annot_name: ANNOT_NAME.into(),
            sat: 8,
            sat_key: 1,
            ..Default::default()
        }]);
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_processor(Arc::new(CddFactory::new(Arc::new(client))));
        Arc::new(dispatcher)
    }

    fn wait_finished(transport: &MemoryTransport) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !transport.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn only_cdd_names_are_served() {
        let dispatcher = dispatcher();
        let reply = Arc::new(Reply::new(MemoryTransport::new()));
        let processors = dispatcher.dispatch_request(Arc::new(annot_request(&["SNP_1"])), reply);
        assert!(processors.is_empty());
    }

    #[test]
    fn annotation_is_sent_from_the_background_thread() {
        let dispatcher = dispatcher();
        let transport = MemoryTransport::new();
        let reply = Arc::new(Reply::new(transport.clone()));
        let processors = dispatcher.dispatch_request(Arc::new(annot_request(&["CDD"])), reply);
        processors[0].process();
        wait_finished(&transport);

        assert!(transport.is_finished());
        assert_eq!(processors[0].status(), ProcessorStatus::Done);
        let annotations = transport
            .headers()
            .into_iter()
            .filter(|h| h.iter().any(|(k, v)| k == "item_type" && v == "bioseq_na"))
            .filter(|h| h.iter().any(|(k, v)| k == "chunk_type" && v == "data"))
            .count();
        assert_eq!(annotations, 1);
    }

    #[test]
    fn unknown_sequence_is_not_found() {
        let dispatcher = dispatcher();
        let transport = MemoryTransport::new();
        let reply = Arc::new(Reply::new(transport.clone()));
        let request = Request::new(RequestPayload::Annot(AnnotRequest {
            seq_id: SeqIdQuery::new("NC_000002.1"),
            names: vec![ANNOT_NAME.into()],
            options: BlobOptions::default(),
        }));
        let processors = dispatcher.dispatch_request(Arc::new(request), reply);
        processors[0].process();
        wait_finished(&transport);

        assert_eq!(processors[0].status(), ProcessorStatus::NotFound);
    }

    #[test]
    fn cancel_reports_canceled_once() {
        let dispatcher = dispatcher();
        let transport = MemoryTransport::new();
        let reply = Arc::new(Reply::new(transport.clone()));
        let processors = dispatcher.dispatch_request(Arc::new(annot_request(&["CDD"])), reply);
        processors[0].cancel();
        processors[0].cancel();
        processors[0].process();

        assert_eq!(processors[0].status(), ProcessorStatus::Canceled);
        assert!(transport.is_finished());
    }
}
