use super::{GROUP_NAME, OsgCaller, OsgFetch, OsgReplyBody, OsgRequestBody, OsgSeverity};
use crate::common::{ErrorCode, ProcessorStatus, Result, Severity, status};
use crate::config::Settings;
use crate::loop_binder::LoopBinder;
use crate::processor::{Processor, ProcessorContext, ProcessorState};
use crate::processor_ref::ProcessorRef;
use crate::processors::{Background, LocalStatus, StartGate, to_json};
use crate::protocol::OutputFormat;
use crate::reply::{Diagnostic, Reply};
use crate::request::{Request, RequestKind, RequestPayload};
use std::sync::Arc;
use std::thread;

/// What every OSG processor shares.
pub struct OsgServices {
    pub caller: OsgCaller,
    /// The loop that completes background fetches. Without it every fetch
    /// runs inline.
    pub binder: Option<Arc<LoopBinder>>,
    pub settings: Arc<Settings>,
}

/// Registry entry for OSG. Serves resolve for configured seq-id namespaces
/// and getblob for configured satellites.
pub struct OsgFactory {
    services: Arc<OsgServices>,
}

impl OsgFactory {
    pub fn new(services: Arc<OsgServices>) -> Self {
        Self { services }
    }
}

impl Processor for OsgFactory {
    fn what_can_process(&self) -> Vec<RequestKind> {
        vec![RequestKind::Resolve, RequestKind::BlobBySatSatKey]
    }

    fn can_process(&self, request: &Request, _reply: &Reply) -> bool {
        let osg = &self.services.settings.osg;
        if !osg.enabled {
            return false;
        }
        match request.payload() {
            RequestPayload::Resolve(r) => osg
                .namespaces
                .iter()
                .any(|ns| r.seq_id.seq_id.starts_with(ns.as_str())),
            RequestPayload::BlobBySatSatKey(r) => osg.sats.contains(&r.blob_id.sat),
            _ => false,
        }
    }

    fn create_processor(&self, ctx: ProcessorContext) -> Option<Arc<dyn Processor>> {
        Some(Arc::new(OsgProcessor::new(ctx, Arc::clone(&self.services))))
    }

    fn process(&self) {}

    fn cancel(&self) {}

    fn status(&self) -> ProcessorStatus {
        ProcessorStatus::InProgress
    }

    fn name(&self) -> &'static str {
        "OSG"
    }

    fn group_name(&self) -> &'static str {
        GROUP_NAME
    }
}

struct OsgProcessorImpl {
    ctx: ProcessorContext,
    services: Arc<OsgServices>,
    state: ProcessorState,
    local: LocalStatus,
    gate: StartGate,
    background: Background,
}

/// A request-scoped OSG processor.
///
/// Background threads reach it only through a [`ProcessorRef`] that is
/// detached when this handle drops, so a fetch finishing after teardown
/// does nothing.
pub struct OsgProcessor {
    inner: Arc<OsgProcessorImpl>,
    handle: Arc<ProcessorRef<OsgProcessorImpl>>,
}

impl OsgProcessor {
    fn new(ctx: ProcessorContext, services: Arc<OsgServices>) -> Self {
        let inner = Arc::new(OsgProcessorImpl {
            ctx,
            services,
            state: ProcessorState::new(),
            local: LocalStatus::new(),
            gate: StartGate::default(),
            background: Background::default(),
        });
        let handle = ProcessorRef::new(Arc::clone(&inner));
        Self { inner, handle }
    }
}

impl Drop for OsgProcessor {
    fn drop(&mut self) {
        self.handle.detach();
    }
}

impl OsgProcessorImpl {
    fn name(&self) -> &'static str {
        match self.ctx.request().kind() {
            RequestKind::Resolve => "OSG-resolve",
            _ => "OSG-getblob",
        }
    }

    fn bodies(&self) -> Vec<OsgRequestBody> {
        match self.ctx.request().payload() {
            RequestPayload::Resolve(r) => vec![OsgRequestBody::Resolve {
                seq_id: r.seq_id.seq_id.clone(),
                seq_id_type: r.seq_id.seq_id_type,
            }],
            RequestPayload::BlobBySatSatKey(r) => vec![OsgRequestBody::GetBlob {
                sat: r.blob_id.sat,
                sat_key: r.blob_id.sat_key,
            }],
            _ => Vec::new(),
        }
    }

    fn cancel(&self) {
        self.state.cancel();
        if !self.background.cancel() {
            self.ctx.signal_finish_processing();
        }
    }

    /// Builds the reply out of the fetch result. Runs on the owning loop.
    fn complete(&self, result: Result<Vec<OsgFetch>>) {
        if self.background.end() || !self.state.is_in_progress() {
            self.ctx.signal_finish_processing();
            return;
        }
        if !self.gate.admit(&self.ctx) {
            self.cancel();
            return;
        }
        match result {
            Ok(fetches) => self.send_fetches(&fetches),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(request_id = self.ctx.request().id(), "OSG call failed: {e}");
                self.local.raise(status::INTERNAL);
                let reply = self.ctx.reply();
                let text = e.to_string();
                reply.prepare_processor_message(
                    reply.item_id(),
                    self.name(),
                    Diagnostic::error(&text, status::INTERNAL, ErrorCode::OsgError),
                );
            }
        }
        self.finalize();
    }

    /// A cancel can land between two fetches; nothing more is written once
    /// it has.
    fn send_fetches(&self, fetches: &[OsgFetch]) {
        for fetch in fetches {
            if !self.state.is_in_progress() {
                return;
            }
            self.send_fetch(fetch);
        }
    }

    fn send_fetch(&self, fetch: &OsgFetch) {
        let reply = self.ctx.reply();
        let name = self.name();
        for osg_reply in &fetch.replies {
            for error in &osg_reply.errors {
                let severity = match error.severity {
                    OsgSeverity::Warning => Severity::Warning,
                    _ => Severity::Error,
                };
                if severity.is_error() {
                    self.local.raise(status::INTERNAL);
                }
                let code = if severity.is_error() { status::INTERNAL } else { status::OK };
                reply.prepare_processor_message(
                    reply.item_id(),
                    name,
                    Diagnostic::new(&error.message, code, ErrorCode::OsgError, severity),
                );
            }
            match &osg_reply.body {
                OsgReplyBody::BioseqInfo(info) => {
                    let (include, format) = match self.ctx.request().payload() {
                        RequestPayload::Resolve(r) => (r.include, r.output_format),
                        _ => continue,
                    };
                    let content = match format {
                        OutputFormat::Json => info.to_json(include),
                        OutputFormat::Protobuf => info.to_protobuf(include),
                    };
                    let item = reply.item_id();
                    reply.prepare_bioseq_data(item, name, &content, format);
                    reply.prepare_bioseq_completion(item, name, 2);
                }
                OsgReplyBody::Blob { props, chunks } => {
                    let blob_id = match &fetch.request {
                        OsgRequestBody::GetBlob { sat, sat_key } => format!("{sat}.{sat_key}"),
                        _ => continue,
                    };
                    let lm = Some(props.last_modified);
                    let prop_item = reply.item_id();
                    let Some(content) = to_json(props, &self.local, "OSG blob properties") else {
                        let text = format!("Blob {blob_id} properties cannot be encoded");
                        reply.prepare_blob_prop_message(
                            prop_item,
                            name,
                            Diagnostic::error(&text, status::INTERNAL, ErrorCode::OsgError),
                        );
                        reply.prepare_blob_prop_completion(prop_item, name, 2);
                        continue;
                    };
                    reply.prepare_blob_prop_data(prop_item, name, &blob_id, &content, lm);
                    reply.prepare_blob_prop_completion(prop_item, name, 2);
                    let blob_item = reply.item_id();
                    for (no, chunk) in chunks.iter().enumerate() {
                        reply.prepare_blob_data(blob_item, name, &blob_id, no as i32, chunk, lm);
                    }
                    reply.prepare_blob_completion(blob_item, name, chunks.len() + 1);
                }
                OsgReplyBody::NotFound => {
                    self.local.raise(status::NOT_FOUND);
                    let text = match &fetch.request {
                        OsgRequestBody::Resolve { seq_id, .. } => format!("Could not resolve seq_id {seq_id}"),
                        OsgRequestBody::GetBlob { sat, sat_key } => format!("Blob {sat}.{sat_key} is not found"),
                        OsgRequestBody::Init => continue,
                    };
                    reply.prepare_processor_message(
                        reply.item_id(),
                        name,
                        Diagnostic::error(&text, status::NOT_FOUND, ErrorCode::NoBioseqInfo),
                    );
                }
                OsgReplyBody::Init | OsgReplyBody::Empty => {}
            }
        }
    }

    fn finalize(&self) {
        if self.state.try_finish(self.local.finish_status()) && !self.background.is_running() {
            self.ctx.trace(&format!("{} finished: {}", self.name(), self.state.get()));
            self.ctx.signal_finish_processing();
        }
    }
}

impl Processor for OsgProcessor {
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
        inner.ctx.trace(&format!("{} started", inner.name()));
        let bodies = inner.bodies();
        let binder = inner
            .services
            .binder
            .as_ref()
            .filter(|_| inner.services.settings.osg.async_processing);
        let Some(binder) = binder.cloned() else {
            let result = inner.services.caller.call(inner.ctx.request(), bodies);
            inner.complete(result);
            return;
        };
        if !inner.background.start() {
            return;
        }

        let handle = Arc::clone(&self.handle);
        let services = Arc::clone(&inner.services);
        let request = Arc::clone(inner.ctx.request());
        let spawned = thread::Builder::new().name("osg-fetch".into()).spawn(move || {
            let result = services.caller.call(&request, bodies);
            let late = Arc::clone(&handle);
            let posted = binder.postpone_invoke(Box::new(move || {
                handle.with(|p| p.complete(result));
            }));
            if posted.is_err() {
                late.with(|p| p.complete(Err(crate::common::Error::ServiceShutdown)));
            }
        });
        if let Err(_e) = spawned {
            #[cfg(feature = "tracing")]
            tracing::error!("Cannot start the OSG fetch thread: {_e}");
            let result = inner.services.caller.call(inner.ctx.request(), inner.bodies());
            inner.complete(result);
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
