//! Whole-genome-shotgun accessions served out of VDB data.
//!
//! WGS accessions are four or six letters followed by digits
//! (`AAAA01000001`, `ABCDEF010000001`). Resolve and get requests for them
//! are answered by a [`WgsClient`]; with a loop binder the client call runs
//! on a detached thread and the reply is built on the binder's thread.

use crate::backend::{BioseqInfo, WgsBlob, WgsClient};
use crate::common::{Error, ErrorCode, ProcessorStatus, Result, status};
use crate::loop_binder::LoopBinder;
use crate::processor::{Processor, ProcessorContext, ProcessorState};
use crate::processor_ref::ProcessorRef;
use crate::processors::{Background, LocalStatus, StartGate};
use crate::protocol::OutputFormat;
use crate::reply::{Diagnostic, Reply};
use crate::request::{Request, RequestKind, RequestPayload, SeqIdQuery};
use std::sync::Arc;
use std::thread;

pub const GROUP_NAME: &str = "WGS";

/// `true` for four or six letters followed by at least three digits.
pub fn is_wgs_accession(seq_id: &str) -> bool {
    let accession = seq_id.split_once('.').map_or(seq_id, |(acc, _)| acc);
    let letters = accession.bytes().take_while(u8::is_ascii_alphabetic).count();
    let digits = &accession[letters..];
    matches!(letters, 4 | 6) && digits.len() >= 3 && digits.bytes().all(|b| b.is_ascii_digit())
}

pub struct WgsServices {
    pub client: Arc<dyn WgsClient>,
    pub binder: Option<Arc<LoopBinder>>,
}

pub struct WgsFactory {
    services: Arc<WgsServices>,
}

impl WgsFactory {
    pub fn new(services: Arc<WgsServices>) -> Self {
        Self { services }
    }
}

impl Processor for WgsFactory {
    fn what_can_process(&self) -> Vec<RequestKind> {
        vec![RequestKind::Resolve, RequestKind::BlobBySeqId]
    }

    fn can_process(&self, request: &Request, _reply: &Reply) -> bool {
        match request.payload() {
            RequestPayload::Resolve(r) => is_wgs_accession(&r.seq_id.seq_id),
            RequestPayload::BlobBySeqId(r) => is_wgs_accession(&r.seq_id.seq_id),
            _ => false,
        }
    }

    fn create_processor(&self, ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        let query = ctx.request().payload().seq_id()?.clone();
        let inner = Arc::new(WgsProcessorImpl {
            ctx,
            services: Arc::clone(&self.services),
            query,
            state: ProcessorState::new(),
            local: LocalStatus::new(),
            gate: StartGate::default(),
            background: Background::default(),
        });
        let handle = ProcessorRef::new(Arc::clone(&inner));
        Some(Arc::new(WgsProcessor { inner, handle }))
    }

    fn process(&self) {}

    fn cancel(&self) {}

    fn status(&self) -> ProcessorStatus {
        ProcessorStatus::InProgress
    }

    fn name(&self) -> &'static str {
        "WGS"
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}

enum WgsData {
    Bioseq(Option<BioseqInfo>),
    Blob(Option<WgsBlob>),
}

struct WgsProcessorImpl {
    ctx: ProcessorContext,
    services: Arc<WgsServices>,
    query: SeqIdQuery,
    state: ProcessorState,
    local: LocalStatus,
    gate: StartGate,
    background: Background,
}

impl WgsProcessorImpl {
    fn name(&self) -> &'static str {
        match self.ctx.request().kind() {
            RequestKind::Resolve => "WGS-resolve",
            _ => "WGS-get",
        }
    }

    fn fetch(client: &dyn WgsClient, kind: RequestKind, query: &SeqIdQuery) -> Result<WgsData> {
        match kind {
            RequestKind::Resolve => client.resolve(query).map(WgsData::Bioseq),
            _ => client.fetch_blob(query).map(WgsData::Blob),
        }
    }

    fn complete(&self, result: Result<WgsData>) {
        if self.background.end() || !self.state.is_in_progress() {
            self.ctx.signal_finish_processing();
            return;
        }
        if !self.gate.admit(&self.ctx) {
            self.cancel();
            return;
        }
        let reply = self.ctx.reply();
        let name = self.name();
        match result {
            Ok(WgsData::Bioseq(Some(info))) => {
                let (include, format) = match self.ctx.request().payload() {
                    RequestPayload::Resolve(r) => (r.include, r.output_format),
                    _ => (Default::default(), OutputFormat::Json),
                };
                let content = match format {
                    OutputFormat::Json => info.to_json(include),
                    OutputFormat::Protobuf => info.to_protobuf(include),
                };
                let item = reply.item_id();
                reply.prepare_bioseq_data(item, name, &content, format);
                reply.prepare_bioseq_completion(item, name, 2);
            }
            Ok(WgsData::Blob(Some(blob))) => {
                let item = reply.item_id();
                for (no, chunk) in blob.chunks.iter().enumerate() {
                    reply.prepare_blob_data(item, name, &blob.blob_id, no as i32, chunk, None);
                }
                reply.prepare_blob_completion(item, name, blob.chunks.len() + 1);
            }
            Ok(WgsData::Bioseq(None) | WgsData::Blob(None)) => {
                self.local.raise(status::NOT_FOUND);
                let text = format!("Could not resolve seq_id {}", self.query);
                reply.prepare_processor_message(
                    reply.item_id(),
                    name,
                    Diagnostic::error(&text, status::NOT_FOUND, ErrorCode::UnresolvedSeqId),
                );
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(request_id = self.ctx.request().id(), "WGS fetch failed: {e}");
                self.local.raise(status::INTERNAL);
                let text = e.to_string();
                reply.prepare_processor_message(
                    reply.item_id(),
                    name,
                    Diagnostic::error(&text, status::INTERNAL, ErrorCode::UnknownError),
                );
            }
        }
        if self.state.try_finish(self.local.finish_status()) {
            self.ctx.signal_finish_processing();
        }
    }

    fn cancel(&self) {
        self.state.cancel();
        if !self.background.cancel() {
            self.ctx.signal_finish_processing();
        }
    }
}

/// Request-scoped WGS processor; see [`crate::processors::osg::OsgProcessor`]
/// for how the background fetch reaches it.
pub struct WgsProcessor {
    inner: Arc<WgsProcessorImpl>,
    handle: Arc<ProcessorRef<WgsProcessorImpl>>,
}

impl Drop for WgsProcessor {
    fn drop(&mut self) {
        self.handle.detach();
    }
}

impl Processor for WgsProcessor {
    fn can_process(&self, _request: &Request, _reply: &Reply) -> bool {
        false
    }

    fn create_processor(&self, _ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        None
    }

    fn process(&self) {
        let inner = &self.inner;
        if !inner.state.is_in_progress() {
            return;
        }
        let kind = inner.ctx.request().kind();
        let Some(binder) = inner.services.binder.clone() else {
            let result = WgsProcessorImpl::fetch(inner.services.client.as_ref(), kind, &inner.query);
            inner.complete(result);
            return;
        };
        if !inner.background.start() {
            return;
        }

        let handle = Arc::clone(&self.handle);
        let client = Arc::clone(&inner.services.client);
        let query = inner.query.clone();
        let spawned = thread::Builder::new().name("wgs-fetch".into()).spawn(move || {
            let result = WgsProcessorImpl::fetch(client.as_ref(), kind, &query);
            let late = Arc::clone(&handle);
            if binder
                .postpone_invoke(Box::new(move || {
                    handle.with(|p| p.complete(result));
                }))
                .is_err()
            {
                late.with(|p| p.complete(Err(Error::ServiceShutdown)));
            }
        });
        if let Err(e) = spawned {
            inner.complete(Err(Error::Backend { message: e.to_string() }));
        }
    }

    fn cancel(&self) {
        self.inner.cancel();
    }

    fn status(&self) -> ProcessorStatus {
        self.inner.state.get()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryWgsClient;
    use crate::dispatcher::Dispatcher;
    use crate::reply::MemoryTransport;
    use crate::request::{BlobBySeqIdRequest, BlobOptions, CacheUsage, IncludeInfo, ResolveRequest};
    use bytes::Bytes;
    use core::time::Duration;
    use std::time::Instant;

    #[test]
    fn accession_shape() {
        assert!(is_wgs_accession("AAAA01000001"));
        assert!(is_wgs_accession("AAAA01000001.1"));
        assert!(is_wgs_accession("ABCDEF010000001"));
        assert!(!is_wgs_accession("NC_000001.11"));
        assert!(!is_wgs_accession("ABCDE01000001"));
        assert!(!is_wgs_accession("AAAA01"));
        assert!(!is_wgs_accession("AAAA0100x001"));
    }

    fn client() -> MemoryWgsClient {
        let mut client = MemoryWgsClient::default();
        client.insert(
            BioseqInfo {
                accession: "AAAA01000001".into(),
                version: 1,
                ..Default::default()
            },
            Some(WgsBlob {
                blob_id: "WGS:AAAA01".into(),
                chunks: vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")],
            }),
        );
        client
    }

    fn dispatcher(binder: Option<Arc<LoopBinder>>) -> Arc<Dispatcher> {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_processor(Arc::new(WgsFactory::new(Arc::new(WgsServices {
            client: Arc::new(client()),
            binder,
        }))));
        Arc::new(dispatcher)
    }

    fn get(seq_id: &str) -> Request {
        Request::new(RequestPayload::BlobBySeqId(BlobBySeqIdRequest {
            seq_id: SeqIdQuery::new(seq_id),
            options: BlobOptions::default(),
        }))
    }

    fn chunk_types(transport: &MemoryTransport, item_type: &str) -> Vec<String> {
        transport
            .headers()
            .into_iter()
            .filter(|h| h.iter().any(|(k, v)| k == "item_type" && v == item_type))
            .filter_map(|h| h.into_iter().find(|(k, _)| k == "chunk_type").map(|(_, v)| v))
            .collect()
    }

    #[test]
    fn inline_get_sends_every_chunk() {
        let dispatcher = dispatcher(None);
        let transport = MemoryTransport::new();
        let processors = dispatcher.dispatch_request(Arc::new(get("AAAA01000001.1")), Arc::new(Reply::new(transport.clone())));
        processors[0].process();

        assert_eq!(processors[0].name(), "WGS-get");
        assert_eq!(processors[0].status(), ProcessorStatus::Done);
        assert_eq!(chunk_types(&transport, "blob"), ["data", "data", "meta"]);
        assert!(transport.is_finished());
    }

    #[test]
    fn inline_resolve_of_unknown_accession_is_not_found() {
        let dispatcher = dispatcher(None);
        let transport = MemoryTransport::new();
        let request = Request::new(RequestPayload::Resolve(ResolveRequest {
            seq_id: SeqIdQuery::new("BBBB01000001"),
            include: IncludeInfo::default(),
            output_format: OutputFormat::Json,
            use_cache: CacheUsage::Default,
        }));
        let processors = dispatcher.dispatch_request(Arc::new(request), Arc::new(Reply::new(transport.clone())));
        processors[0].process();

        assert_eq!(processors[0].status(), ProcessorStatus::NotFound);
        assert_eq!(chunk_types(&transport, "processor"), ["message", "meta"]);
    }

    #[test]
    fn background_get_completes_on_a_spawned_loop() {
        let (binder, runner) = LoopBinder::spawn("wgs-test-loop").unwrap();
        let dispatcher = dispatcher(Some(Arc::clone(&binder)));
        let transport = MemoryTransport::new();
        let processors = dispatcher.dispatch_request(Arc::new(get("AAAA01000001")), Arc::new(Reply::new(transport.clone())));
        processors[0].process();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !transport.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(transport.is_finished());
        assert_eq!(chunk_types(&transport, "blob").len(), 3);

        binder.shutdown();
        runner.join().unwrap();
    }
}
